//! Wire messages between master and workers

use serde::{Deserialize, Serialize};

use crate::config::Profile;
use crate::state::State;
use crate::stats::ReportData;
use crate::task::TaskPayload;

/// Identity a worker presents when registering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node id
    pub id: String,
    /// Address the worker reports for itself
    pub ip: String,
    /// Operating system
    pub os: String,
    /// CPU architecture
    pub arch: String,
}

impl NodeInfo {
    /// Describe the local host under `id`
    pub fn local(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ip: String::new(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// First frame on every connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    /// Create the master-side node
    Register {
        /// Bearer token
        token: Option<String>,
        /// Worker identity
        node: NodeInfo,
    },
    /// Remove the master-side node
    SignOut {
        /// Bearer token
        token: Option<String>,
        /// Registered node id
        node_id: String,
    },
    /// Turn this connection into the node's message stream
    Stream {
        /// Bearer token
        token: Option<String>,
        /// Registered node id
        node_id: String,
    },
}

impl Request {
    /// The token carried by the request
    pub fn token(&self) -> Option<&str> {
        match self {
            Request::Register { token, .. }
            | Request::SignOut { token, .. }
            | Request::Stream { token, .. } => token.as_deref(),
        }
    }
}

/// Answer to a [`Request`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Whether the request was accepted
    pub ok: bool,
    /// Reason for a rejection
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Reply {
    /// Accept
    pub fn ok() -> Self {
        Self {
            ok: true,
            message: String::new(),
        }
    }

    /// Reject with a reason
    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Liveness and resource usage sent by a worker every second
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {
    /// Worker runner state
    pub state: State,
    /// Process CPU usage in percent
    pub cpu_usage: f64,
    /// Process resident memory in MiB
    pub memory_usage: f64,
    /// Users currently running
    pub user_count: i64,
}

/// A control or telemetry message on a node's stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    /// Master → worker: start a run with these tasks
    Spawn {
        /// This worker's share of the profile
        profile: Profile,
        /// Serialized task definitions
        tasks: TaskPayload,
    },
    /// Master → worker: re-target a running controller
    Rebalance {
        /// This worker's new share of the profile
        profile: Profile,
    },
    /// Master → worker: stop the current run
    Stop,
    /// Either direction: shut down
    Quit,
    /// Worker → master: a spawn started
    Spawning,
    /// Worker → master: the ramp reached its target
    SpawningComplete {
        /// Users running
        user_count: i64,
    },
    /// Worker → master: liveness
    Heartbeat(HeartbeatData),
    /// Worker → master: a stop completed
    ClientStopped,
    /// Worker → master: back in init and ready for work
    ClientReady,
    /// Worker → master: statistics for the last interval
    Stats(Box<ReportData>),
    /// Worker → master: a task panicked
    Exception {
        /// Panic message
        error: String,
    },
}

impl Message {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Spawn { .. } => "spawn",
            Message::Rebalance { .. } => "rebalance",
            Message::Stop => "stop",
            Message::Quit => "quit",
            Message::Spawning => "spawning",
            Message::SpawningComplete { .. } => "spawning_complete",
            Message::Heartbeat(_) => "heartbeat",
            Message::ClientStopped => "client_stopped",
            Message::ClientReady => "client_ready",
            Message::Stats(_) => "stats",
            Message::Exception { .. } => "exception",
        }
    }
}

/// A message tagged with the node it concerns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending or receiving node
    pub node_id: String,
    /// Payload
    pub message: Message,
}

impl Envelope {
    /// Wrap a message
    pub fn new(node_id: impl Into<String>, message: Message) -> Self {
        Self {
            node_id: node_id.into(),
            message,
        }
    }
}
