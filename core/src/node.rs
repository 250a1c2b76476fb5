//! Master-side view of connected workers

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::config::HEARTBEAT_LIVENESS;
use crate::error::{SwarmError, SwarmResult};
use crate::state::{Event, State, StateCell};
use crate::transport::{HeartbeatData, Message, NodeInfo};

/// Resource usage last reported by a worker
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeUsage {
    /// Users running on the worker
    pub user_count: i64,
    /// CPU usage in percent
    pub cpu_usage: f64,
    /// Resident memory in MiB
    pub memory_usage: f64,
}

/// One connected worker as seen by the master
#[derive(Debug)]
pub struct WorkerNode {
    info: NodeInfo,
    state: StateCell,
    heartbeat: AtomicI32,
    usage: RwLock<NodeUsage>,
    stream: RwLock<Option<mpsc::UnboundedSender<Message>>>,
}

impl WorkerNode {
    /// Create a node in `Init` with a full liveness budget
    pub fn new(info: NodeInfo) -> Self {
        Self {
            info,
            state: StateCell::new(State::Init),
            heartbeat: AtomicI32::new(HEARTBEAT_LIVENESS),
            usage: RwLock::new(NodeUsage::default()),
            stream: RwLock::new(None),
        }
    }

    /// Node id
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Registration details
    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    /// Current state
    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Adopt a state reported by the worker itself
    pub fn set_state(&self, state: State) {
        self.state.mirror(state);
    }

    /// Last reported usage
    pub fn usage(&self) -> NodeUsage {
        *self.usage.read()
    }

    /// Users running on the worker
    pub fn user_count(&self) -> i64 {
        self.usage.read().user_count
    }

    /// Record the user count from a spawn report
    pub fn set_user_count(&self, user_count: i64) {
        self.usage.write().user_count = user_count;
    }

    /// Apply a heartbeat: refill liveness and adopt the reported status
    pub fn beat(&self, data: &HeartbeatData) {
        self.heartbeat.store(HEARTBEAT_LIVENESS, Ordering::Release);
        *self.usage.write() = NodeUsage {
            user_count: data.user_count,
            cpu_usage: data.cpu_usage,
            memory_usage: data.memory_usage,
        };
        if self.state() != State::Quitting {
            self.state.mirror(data.state);
        }
    }

    /// Spend one unit of liveness; returns true when the node just went missing
    pub fn tick_liveness(&self) -> bool {
        let remaining = self.heartbeat.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 0 {
            return false;
        }
        match self.state() {
            State::Missing | State::Quitting => false,
            _ => self.state.apply(Event::Lost).is_ok(),
        }
    }

    /// Remaining liveness
    pub fn liveness(&self) -> i32 {
        self.heartbeat.load(Ordering::Acquire)
    }

    /// Attach the sender of a freshly opened stream
    pub fn attach(&self, sender: mpsc::UnboundedSender<Message>) {
        *self.stream.write() = Some(sender);
    }

    /// Detach `sender` if it is still the active stream
    pub fn detach(&self, sender: &mpsc::UnboundedSender<Message>) {
        let mut stream = self.stream.write();
        if stream.as_ref().is_some_and(|s| s.same_channel(sender)) {
            *stream = None;
        }
    }

    /// Whether a stream is attached
    pub fn is_connected(&self) -> bool {
        self.stream.read().is_some()
    }

    /// Queue a message on the node's stream
    pub fn send(&self, message: Message) -> SwarmResult<()> {
        let stream = self.stream.read();
        let sender = stream
            .as_ref()
            .ok_or_else(|| SwarmError::transport(format!("node {} has no stream", self.id())))?;
        sender
            .send(message)
            .map_err(|_| SwarmError::transport(format!("stream to node {} is closed", self.id())))
    }
}

/// Concurrent registry of worker nodes keyed by id
#[derive(Debug, Default)]
pub struct WorkerNodes {
    nodes: DashMap<String, Arc<WorkerNode>>,
}

impl WorkerNodes {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node, replacing any node with the same id
    pub fn insert(&self, node: WorkerNode) -> Arc<WorkerNode> {
        let node = Arc::new(node);
        self.nodes.insert(node.id().to_string(), Arc::clone(&node));
        node
    }

    /// Remove a node
    pub fn remove(&self, id: &str) -> Option<Arc<WorkerNode>> {
        self.nodes.remove(id).map(|(_, node)| node)
    }

    /// Look up a node
    pub fn get(&self, id: &str) -> Option<Arc<WorkerNode>> {
        self.nodes.get(id).map(|node| Arc::clone(node.value()))
    }

    /// Number of registered nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node is registered
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Snapshot of every node, sorted by id
    pub fn all(&self) -> Vec<Arc<WorkerNode>> {
        let mut nodes: Vec<_> = self.nodes.iter().map(|n| Arc::clone(n.value())).collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        nodes
    }

    /// Snapshot of the nodes that can receive work, sorted by id
    pub fn available(&self) -> Vec<Arc<WorkerNode>> {
        self.all()
            .into_iter()
            .filter(|node| node.state().is_available())
            .collect()
    }

    /// Sum of user counts over available nodes
    pub fn user_count(&self) -> i64 {
        self.available().iter().map(|node| node.user_count()).sum()
    }

    /// Whether any node is in `state`
    pub fn any_in(&self, state: State) -> bool {
        self.nodes.iter().any(|node| node.state() == state)
    }

    /// Whether any node is spawning or running
    pub fn any_starting(&self) -> bool {
        self.nodes.iter().any(|node| node.state().is_starting())
    }

    /// Whether every available node is idle
    pub fn all_ready(&self) -> bool {
        self.available().iter().all(|node| node.state().is_ready())
    }

    /// Send a message to every available node, returning how many accepted it
    pub fn broadcast(&self, message: &Message) -> usize {
        let mut sent = 0;
        for node in self.available() {
            match node.send(message.clone()) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!(node_id = node.id(), error = %e, "Broadcast failed"),
            }
        }
        sent
    }
}
