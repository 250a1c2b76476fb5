//! Master runner: coordinates workers and aggregates their reports
//!
//! The master never runs tasks. It splits the profile across available
//! workers, pushes control messages down their streams, and derives its own
//! state from what the workers report. Three background loops run beside the
//! server: heartbeat liveness, the aggregate state machine, and the optional
//! auto-start.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::channel::ChannelConfig;
use crate::config::{
    MasterConfig, Profile, HEARTBEAT_INTERVAL, STATE_MACHINE_INTERVAL, TASK_FETCH_TIMEOUT,
};
use crate::error::{SwarmError, SwarmResult};
use crate::node::WorkerNodes;
use crate::output::{Output, Outputs};
use crate::state::{Event, State, StateCell};
use crate::stats::{ReportData, StatsPipeline};
use crate::task::TaskPayload;
use crate::transport::{Envelope, MasterServer, Message, ServerEvent};

/// How often auto-start checks the connected worker count
const AUTO_START_POLL: Duration = Duration::from_millis(100);

/// A request for the task definitions of the next run
///
/// Obtained from [`MasterRunner::take_task_requests`]; answer it with
/// [`respond`](Self::respond) within the fetch timeout.
#[derive(Debug)]
pub struct TaskRequest {
    reply: oneshot::Sender<TaskPayload>,
}

impl TaskRequest {
    /// Answer with the payload sent to every worker
    pub fn respond(self, payload: TaskPayload) {
        if self.reply.send(payload).is_err() {
            tracing::debug!("Task request abandoned before the reply");
        }
    }
}

struct StatsRun {
    done: CancellationToken,
    handle: JoinHandle<()>,
}

struct Bound {
    server: MasterServer,
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

/// Coordinates a fleet of workers
pub struct MasterRunner {
    config: MasterConfig,
    profile: RwLock<Profile>,
    nodes: Arc<WorkerNodes>,
    state: Arc<StateCell>,
    stats: StatsPipeline,
    outputs: Outputs,
    tasks: Mutex<Option<TaskPayload>>,
    task_requests: mpsc::Sender<TaskRequest>,
    task_poller: Mutex<Option<mpsc::Receiver<TaskRequest>>>,
    stats_run: Mutex<Option<StatsRun>>,
    bound: Mutex<Option<Bound>>,
    shutdown: CancellationToken,
}

impl MasterRunner {
    /// Create a master that will distribute `profile`
    pub fn new(config: MasterConfig, profile: Profile) -> Self {
        let (task_requests, task_poller) = mpsc::channel(1);
        Self {
            config,
            profile: RwLock::new(profile),
            nodes: Arc::new(WorkerNodes::new()),
            state: Arc::new(StateCell::new(State::Init)),
            stats: StatsPipeline::new(&ChannelConfig::default()),
            outputs: Outputs::new(),
            tasks: Mutex::new(None),
            task_requests,
            task_poller: Mutex::new(Some(task_poller)),
            stats_run: Mutex::new(None),
            bound: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register an output
    pub fn with_output(mut self, output: Arc<dyn Output>) -> Self {
        self.outputs.push(output);
        self
    }

    /// Replace the stats channel configuration
    pub fn with_channel_config(mut self, channel_config: ChannelConfig) -> Self {
        self.stats = StatsPipeline::new(&channel_config);
        self
    }

    /// Aggregate state
    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Connected workers
    pub fn nodes(&self) -> &Arc<WorkerNodes> {
        &self.nodes
    }

    /// Users running across all available workers
    pub fn user_count(&self) -> i64 {
        self.nodes.user_count()
    }

    /// Profile used by the next start or rebalance
    pub fn profile(&self) -> Profile {
        self.profile.read().clone()
    }

    /// Replace the profile; takes effect on the next start or rebalance
    pub fn set_profile(&self, profile: Profile) {
        *self.profile.write() = profile;
    }

    /// Token that ends [`run`](Self::run) when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Receiver of task requests; `None` after the first call
    ///
    /// Whoever holds it supplies the payload for every start.
    pub fn take_task_requests(&self) -> Option<mpsc::Receiver<TaskRequest>> {
        self.task_poller.lock().take()
    }

    /// Bind the control server ahead of [`run`](Self::run)
    pub async fn bind(&self) -> SwarmResult<SocketAddr> {
        let bound = self.bind_server().await?;
        let addr = bound.server.local_addr()?;
        *self.bound.lock() = Some(bound);
        Ok(addr)
    }

    async fn bind_server(&self) -> SwarmResult<Bound> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let server = MasterServer::bind(
            self.config.bind,
            Arc::clone(&self.nodes),
            self.config.token.clone(),
            events_tx,
        )
        .await?;
        Ok(Bound { server, events })
    }

    /// Serve workers until [`quit`](Self::quit) is called or the shutdown
    /// token is cancelled
    pub async fn run(self: &Arc<Self>) -> SwarmResult<()> {
        let bound = self.bound.lock().take();
        let Bound { server, mut events } = match bound {
            Some(bound) => bound,
            None => self.bind_server().await?,
        };

        let tracker = TaskTracker::new();
        tracker.spawn(server.serve(self.shutdown.clone()));
        tracker.spawn(Arc::clone(self).watch_heartbeats());
        tracker.spawn(Arc::clone(self).drive_state_machine());
        if let Some(expected) = self.config.expect_workers {
            tracker.spawn(Arc::clone(self).auto_start(expected));
        }
        tracker.close();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.on_server_event(event).await,
                    None => break,
                },
            }
        }

        self.quit();
        let stats_run = self.stats_run.lock().take();
        self.finish_stats(stats_run).await;
        tracker.wait().await;
        tracing::info!("Master exited");
        Ok(())
    }

    /// Fetch the tasks and send every available worker its share
    ///
    /// # Errors
    ///
    /// Fails without side effects if no worker is available, if the spawn
    /// count cannot cover every worker, if the profile is invalid, if a run
    /// is already active, or if the task fetch fails.
    pub async fn start(&self) -> SwarmResult<()> {
        let from = self.state.get();
        if from.on(Event::Start).is_none() {
            return Err(SwarmError::InvalidTransition {
                from,
                event: Event::Start,
            });
        }

        let profile = self.profile();
        profile.validate()?;
        let nodes = self.nodes.available();
        check_workers(&profile, nodes.len())?;

        let payload = self.fetch_test_cases().await?;
        self.state.apply(Event::Start)?;
        *self.tasks.lock() = Some(payload.clone());
        self.begin_stats().await;

        for (node, share) in nodes.iter().zip(profile.split(nodes.len())) {
            let message = Message::Spawn {
                profile: share,
                tasks: payload.clone(),
            };
            if let Err(e) = node.send(message) {
                tracing::warn!(node_id = node.id(), error = %e, "Spawn not delivered");
            }
        }

        tracing::info!(
            workers = nodes.len(),
            spawn_count = profile.spawn_count,
            spawn_rate = profile.spawn_rate,
            "Run started"
        );
        Ok(())
    }

    /// Re-split the profile over the available workers without restarting
    ///
    /// Workers still in Init get a full spawn; the rest are re-targeted.
    pub fn rebalance(&self) -> SwarmResult<()> {
        let profile = self.profile();
        profile.validate()?;
        let nodes = self.nodes.available();
        check_workers(&profile, nodes.len())?;
        let payload = self
            .tasks
            .lock()
            .clone()
            .ok_or_else(|| SwarmError::config("no run to rebalance"))?;
        self.state.apply(Event::Rebalance)?;

        for (node, share) in nodes.iter().zip(profile.split(nodes.len())) {
            let message = if node.state() == State::Init {
                Message::Spawn {
                    profile: share,
                    tasks: payload.clone(),
                }
            } else {
                Message::Rebalance { profile: share }
            };
            if let Err(e) = node.send(message) {
                tracing::warn!(node_id = node.id(), error = %e, "Rebalance not delivered");
            }
        }

        tracing::info!(
            workers = nodes.len(),
            spawn_count = profile.spawn_count,
            "Run rebalanced"
        );
        Ok(())
    }

    /// Tell every worker to stop
    pub fn stop(&self) -> SwarmResult<()> {
        self.state.apply(Event::Stop)?;
        let sent = self.nodes.broadcast(&Message::Stop);
        tracing::info!(workers = sent, "Stopping workers");
        Ok(())
    }

    /// Tell every worker to quit and end [`run`](Self::run)
    pub fn quit(&self) {
        if self.state.apply(Event::Quit).is_ok() {
            let sent = self.nodes.broadcast(&Message::Quit);
            tracing::info!(workers = sent, "Sent quit to workers");
        }
        self.shutdown.cancel();
    }

    /// Spend one unit of liveness on every node
    pub fn check_heartbeats(&self) {
        for node in self.nodes.all() {
            if node.tick_liveness() {
                tracing::warn!(node_id = node.id(), "Worker missed its heartbeats, marked missing");
            }
        }
    }

    /// Advance the aggregate state from the workers' states
    pub async fn tick_state_machine(&self) {
        match self.state.get() {
            State::Spawning => {
                let target = self.profile.read().spawn_count;
                let user_count = self.nodes.user_count();
                if user_count == target && self.state.apply(Event::SpawnComplete).is_ok() {
                    tracing::info!(user_count, "All workers finished spawning");
                }
            }
            State::Running => {
                if !self.nodes.any_starting() {
                    if self.state.apply(Event::Stop).is_ok() {
                        tracing::info!("No worker is running, stopping");
                    }
                } else if self.nodes.any_in(State::Init) {
                    tracing::info!("Idle worker joined the run, rebalancing");
                    if let Err(e) = self.rebalance() {
                        tracing::warn!(error = %e, "Rebalance failed");
                    }
                }
            }
            State::Stopping => {
                if self.nodes.all_ready() {
                    let stats_run = self.stats_run.lock().take();
                    if self.state.apply(Event::Stopped).is_ok() {
                        tracing::info!("All workers stopped");
                    }
                    self.finish_stats(stats_run).await;
                }
            }
            _ => {}
        }
    }

    async fn fetch_test_cases(&self) -> SwarmResult<TaskPayload> {
        let (reply, response) = oneshot::channel();
        let fetch = async {
            self.task_requests
                .send(TaskRequest { reply })
                .await
                .map_err(|_| SwarmError::config("no task poller is running"))?;
            response
                .await
                .map_err(|_| SwarmError::config("task poller dropped the request"))
        };
        timeout(TASK_FETCH_TIMEOUT, fetch)
            .await
            .map_err(|_| SwarmError::TaskFetchTimeout(TASK_FETCH_TIMEOUT))?
    }

    async fn begin_stats(&self) {
        let active = self.stats_run.lock().is_some();
        if active {
            return;
        }
        self.outputs.on_start().await;

        let nodes = Arc::clone(&self.nodes);
        let state = Arc::clone(&self.state);
        let done = CancellationToken::new();
        let handle = self.stats.spawn_aggregator(
            done.clone(),
            move || (nodes.user_count(), state.get()),
            Arc::new(self.outputs.clone()),
        );
        *self.stats_run.lock() = Some(StatsRun { done, handle });
    }

    async fn finish_stats(&self, stats_run: Option<StatsRun>) {
        let Some(StatsRun { done, handle }) = stats_run else {
            return;
        };
        done.cancel();
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Stats aggregator failed");
        }
        self.outputs.on_stop().await;
    }

    async fn forward_report(&self, report: ReportData) {
        let active = self.stats_run.lock().is_some();
        if !active {
            tracing::debug!(requests = report.num_requests(), "Report outside a run dropped");
            return;
        }
        if self.stats.forwarder().send(report).await.is_err() {
            tracing::debug!("Stats pipeline closed, report dropped");
        }
    }

    async fn on_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Registered(node_id) => {
                tracing::debug!(node_id = %node_id, workers = self.nodes.len(), "Worker joined");
            }
            ServerEvent::SignedOut(node_id) => {
                tracing::debug!(node_id = %node_id, workers = self.nodes.len(), "Worker left");
            }
            ServerEvent::Disconnected(node_id) => {
                tracing::debug!(node_id = %node_id, "Worker stream closed");
            }
            ServerEvent::Message(envelope) => self.on_message(envelope).await,
        }
    }

    async fn on_message(&self, envelope: Envelope) {
        let Envelope { node_id, message } = envelope;
        let Some(node) = self.nodes.get(&node_id) else {
            tracing::debug!(node_id = %node_id, kind = message.kind(), "Message from unknown worker");
            return;
        };

        match message {
            Message::Heartbeat(data) => node.beat(&data),
            Message::Spawning => node.set_state(State::Spawning),
            Message::SpawningComplete { user_count } => {
                node.set_state(State::Running);
                node.set_user_count(user_count);
                tracing::info!(node_id = %node_id, user_count, "Worker finished spawning");
            }
            Message::ClientStopped => {
                node.set_state(State::Stopped);
                node.set_user_count(0);
                tracing::info!(node_id = %node_id, "Worker stopped");
            }
            Message::ClientReady => {
                node.set_state(State::Init);
                node.set_user_count(0);
                tracing::info!(node_id = %node_id, "Worker ready");
            }
            Message::Stats(report) => self.forward_report(*report).await,
            Message::Exception { error } => {
                tracing::warn!(node_id = %node_id, error = %error, "Worker task panicked");
            }
            Message::Quit => {
                node.set_state(State::Quitting);
                tracing::info!(node_id = %node_id, "Worker quit");
            }
            other => {
                tracing::warn!(node_id = %node_id, kind = other.kind(), "Unexpected message from worker");
            }
        }
    }

    async fn watch_heartbeats(self: Arc<Self>) {
        let mut ticker = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.check_heartbeats(),
            }
        }
    }

    async fn drive_state_machine(self: Arc<Self>) {
        let mut ticker = interval_at(
            Instant::now() + STATE_MACHINE_INTERVAL,
            STATE_MACHINE_INTERVAL,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick_state_machine().await,
            }
        }
    }

    async fn auto_start(self: Arc<Self>, expected: usize) {
        let deadline = Instant::now() + self.config.expect_workers_max_wait;
        let mut ticker = tokio::time::interval(AUTO_START_POLL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let available = self.nodes.available().len();
            if available >= expected {
                tracing::info!(workers = available, "Expected workers connected, starting");
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    workers = available,
                    expected,
                    "Gave up waiting for workers, starting with those connected"
                );
                break;
            }
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            started = self.start() => {
                if let Err(e) = started {
                    tracing::error!(error = %e, "Auto start failed");
                }
            }
        }
    }
}

fn check_workers(profile: &Profile, workers: usize) -> SwarmResult<()> {
    if workers == 0 {
        return Err(SwarmError::NoWorkers);
    }
    if profile.spawn_count < workers as i64 {
        return Err(SwarmError::SpawnCountTooSmall {
            spawn_count: profile.spawn_count,
            workers,
        });
    }
    // Every worker needs a whole share of a bounded limit.
    for (name, limit) in [("loop count", profile.loop_count), ("max rps", profile.max_rps)] {
        if limit > 0 && limit < workers as i64 {
            return Err(SwarmError::config(format!(
                "{name} {limit} is lower than the {workers} available workers"
            )));
        }
    }
    Ok(())
}

impl std::fmt::Debug for MasterRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterRunner")
            .field("bind", &self.config.bind)
            .field("state", &self.state.get())
            .field("workers", &self.nodes.len())
            .field("outputs", &self.outputs)
            .finish()
    }
}
