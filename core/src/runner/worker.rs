//! Worker runner: executes the master's runs and streams results back
//!
//! A single loop owns the connection. A reader task forwards whatever the
//! master sends; everything the worker sends (replies, heartbeats, stats
//! reports, run hooks) is written from the loop, so writes never interleave.
//! Consecutive send failures mark the worker Missing, and the next heartbeat
//! tick re-registers and reopens the stream.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::shared::{RunHooks, RunnerCore};
use crate::channel::ChannelConfig;
use crate::config::{Profile, WorkerConfig, HEARTBEAT_INTERVAL, MAX_SEND_FAILURES};
use crate::error::{SwarmError, SwarmResult};
use crate::state::{Event, State};
use crate::stats::{ReportData, ReportSink, StatsRecorder};
use crate::system::{generate_node_id, SystemMonitor};
use crate::task::{TaskFactory, TaskPayload};
use crate::transport::{HeartbeatData, Message, NodeInfo, StreamSender, WorkerClient};

/// Queue of messages waiting to be written to the master
#[derive(Clone)]
struct Outbound(mpsc::UnboundedSender<Message>);

impl Outbound {
    fn push(&self, message: Message) {
        if let Err(e) = self.0.send(message) {
            tracing::debug!(kind = e.0.kind(), "Worker loop gone, message dropped");
        }
    }
}

#[async_trait]
impl ReportSink for Outbound {
    async fn publish(&self, report: ReportData) {
        self.push(Message::Stats(Box::new(report)));
    }
}

struct WorkerHooks {
    outbound: Outbound,
}

impl RunHooks for WorkerHooks {
    fn spawn_complete(&self, user_count: i64) {
        self.outbound.push(Message::SpawningComplete { user_count });
    }

    fn task_panicked(&self, error: &str) {
        self.outbound.push(Message::Exception {
            error: error.to_string(),
        });
    }

    fn stopped(&self) {
        self.outbound.push(Message::ClientStopped);
    }
}

/// A message read from one generation of the stream; `None` means it closed
struct Inbound {
    generation: u64,
    message: Option<Message>,
}

#[derive(Default)]
struct Link {
    sender: Option<StreamSender>,
    reader: Option<JoinHandle<()>>,
    generation: u64,
    failures: u32,
}

impl Link {
    fn close(&mut self) {
        self.sender = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

enum Flow {
    Continue,
    Exit,
}

/// Runs users on behalf of a master
pub struct WorkerRunner {
    config: WorkerConfig,
    client: WorkerClient,
    factory: Arc<dyn TaskFactory>,
    core: Arc<RunnerCore>,
    shutdown: CancellationToken,
}

impl WorkerRunner {
    /// Create a worker that builds its tasks with `factory`
    pub fn new(config: WorkerConfig, factory: Arc<dyn TaskFactory>) -> Self {
        let node_id = config.node_id.clone().unwrap_or_else(generate_node_id);
        let client = WorkerClient::new(config.master, config.token.clone(), NodeInfo::local(node_id));
        Self {
            config,
            client,
            factory,
            core: Arc::new(RunnerCore::new(&ChannelConfig::default())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the stats channel configuration
    pub fn with_channel_config(mut self, channel_config: ChannelConfig) -> Self {
        self.core = Arc::new(RunnerCore::new(&channel_config));
        self
    }

    /// This worker's node id
    pub fn node_id(&self) -> &str {
        self.client.node_id()
    }

    /// Current state
    pub fn state(&self) -> State {
        self.core.state()
    }

    /// Users currently running
    pub fn user_count(&self) -> i64 {
        self.core.user_count()
    }

    /// Recorder shared by every run of this worker
    pub fn recorder(&self) -> &StatsRecorder {
        self.core.recorder()
    }

    /// Token that ends [`run`](Self::run) when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register with the master and serve it until told to quit
    ///
    /// # Errors
    ///
    /// Fails only if the first registration or stream open fails; later
    /// connection faults are retried.
    pub async fn run(&self) -> SwarmResult<()> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let outbound = Outbound(outbound_tx);
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let mut link = Link::default();

        self.connect(&mut link, &inbound_tx).await?;
        tracing::info!(
            node_id = %self.node_id(),
            master = %self.client.master(),
            "Connected to master"
        );

        let mut monitor = SystemMonitor::new();
        let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let quit_by_master = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break false,

                Some(message) = outbound_rx.recv() => self.deliver(&mut link, message).await,

                Some(inbound) = inbound_rx.recv() => {
                    if inbound.generation != link.generation {
                        continue;
                    }
                    match inbound.message {
                        Some(message) => {
                            if let Flow::Exit = self.handle(message, &outbound).await {
                                break true;
                            }
                        }
                        None => {
                            tracing::warn!("Stream to master closed");
                            link.close();
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    self.on_heartbeat(&mut link, &mut monitor, &inbound_tx).await;
                }
            }
        };

        if let Err(e) = self.core.stop().await {
            tracing::warn!(error = %e, "Stop on shutdown failed");
        }
        // Final stats report and ClientStopped are queued by the stop.
        while let Ok(message) = outbound_rx.try_recv() {
            self.deliver(&mut link, message).await;
        }
        if !quit_by_master {
            self.deliver(&mut link, Message::Quit).await;
        }
        if let Err(e) = self.core.apply(Event::Quit) {
            tracing::debug!(error = %e, "Quit transition rejected");
        }
        if let Err(e) = self.client.sign_out().await {
            tracing::debug!(error = %e, "Sign out failed");
        }
        link.close();

        tracing::info!(node_id = %self.node_id(), "Worker exited");
        Ok(())
    }

    async fn connect(&self, link: &mut Link, inbound: &mpsc::UnboundedSender<Inbound>) -> SwarmResult<()> {
        self.client.register().await?;
        let (mut receiver, sender) = self.client.open_stream().await?;

        link.close();
        link.generation += 1;
        link.failures = 0;

        let generation = link.generation;
        let inbound = inbound.clone();
        link.reader = Some(tokio::spawn(async move {
            loop {
                let message = match receiver.recv().await {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(error = %e, "Read from master failed");
                        None
                    }
                };
                let closed = message.is_none();
                if inbound.send(Inbound { generation, message }).is_err() || closed {
                    break;
                }
            }
        }));
        link.sender = Some(sender);
        Ok(())
    }

    async fn deliver(&self, link: &mut Link, message: Message) {
        let kind = message.kind();
        let result = match link.sender.as_mut() {
            Some(sender) => sender.send(message).await,
            None => Err(SwarmError::transport("no stream to master")),
        };

        match result {
            Ok(()) => link.failures = 0,
            Err(e) => {
                link.failures += 1;
                link.sender = None;
                tracing::warn!(kind, failures = link.failures, error = %e, "Send to master failed");
                if link.failures >= MAX_SEND_FAILURES && self.core.state() != State::Missing {
                    self.on_lost(link).await;
                }
            }
        }
    }

    async fn on_lost(&self, link: &mut Link) {
        tracing::warn!(failures = link.failures, "Lost contact with master");
        link.close();
        if let Err(e) = self.core.stop().await {
            tracing::warn!(error = %e, "Stop after losing master failed");
        }
        if let Err(e) = self.core.apply(Event::Lost) {
            tracing::debug!(error = %e, "Lost transition rejected");
        }
    }

    async fn on_heartbeat(
        &self,
        link: &mut Link,
        monitor: &mut SystemMonitor,
        inbound: &mpsc::UnboundedSender<Inbound>,
    ) {
        if self.core.state() == State::Missing {
            match self.connect(link, inbound).await {
                Ok(()) => {
                    if let Err(e) = self.core.apply(Event::Reconnect) {
                        tracing::warn!(error = %e, "Reconnect transition rejected");
                    }
                    tracing::info!(node_id = %self.node_id(), "Reconnected to master");
                    self.deliver(link, Message::ClientReady).await;
                }
                Err(e) => tracing::debug!(error = %e, "Reconnect failed"),
            }
            return;
        }

        let (cpu_usage, memory_usage) = monitor.sample();
        let data = HeartbeatData {
            state: self.core.state(),
            cpu_usage,
            memory_usage,
            user_count: self.core.user_count(),
        };
        self.deliver(link, Message::Heartbeat(data)).await;
    }

    async fn handle(&self, message: Message, outbound: &Outbound) -> Flow {
        tracing::debug!(kind = message.kind(), "Message from master");
        match message {
            Message::Spawn { profile, tasks } => self.on_spawn(profile, &tasks, outbound),
            Message::Rebalance { profile } => {
                outbound.push(Message::Spawning);
                if let Err(e) = self.core.rebalance(&profile) {
                    tracing::warn!(error = %e, "Rebalance rejected");
                }
            }
            Message::Stop => {
                // Users may take a while to drain; keep heartbeating meanwhile.
                let core = Arc::clone(&self.core);
                tokio::spawn(async move {
                    if let Err(e) = core.stop().await {
                        tracing::warn!(error = %e, "Stop failed");
                    }
                });
            }
            Message::Quit => {
                tracing::info!(ignore_quit = self.config.ignore_quit, "Master sent quit");
                if !self.config.ignore_quit {
                    return Flow::Exit;
                }
                if let Err(e) = self.core.stop().await {
                    tracing::warn!(error = %e, "Stop on quit failed");
                }
            }
            other => tracing::warn!(kind = other.kind(), "Unexpected message from master"),
        }
        Flow::Continue
    }

    fn on_spawn(&self, profile: Profile, payload: &TaskPayload, outbound: &Outbound) {
        outbound.push(Message::Spawning);

        if self.core.state().is_starting() {
            if let Err(e) = self.core.rebalance(&profile) {
                tracing::warn!(error = %e, "Rebalance rejected");
            }
            return;
        }

        let started = self.factory.build(payload, self.core.recorder()).and_then(|tasks| {
            self.core.start(
                profile,
                tasks,
                Arc::new(outbound.clone()),
                Arc::new(WorkerHooks {
                    outbound: outbound.clone(),
                }),
            )
        });
        if let Err(e) = started {
            tracing::error!(error = %e, "Failed to start run");
            outbound.push(Message::Exception {
                error: e.to_string(),
            });
        }
    }
}

impl std::fmt::Debug for WorkerRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRunner")
            .field("node_id", &self.node_id())
            .field("master", &self.client.master())
            .field("state", &self.core.state())
            .finish()
    }
}
