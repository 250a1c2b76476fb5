//! Run lifecycle shared by the local and worker runners

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::controller::Controller;
use super::quota::LoopQuota;
use crate::channel::ChannelConfig;
use crate::config::Profile;
use crate::error::{SwarmError, SwarmResult};
use crate::rate_limiter::{RampUpRateLimiter, RateLimiter, StableRateLimiter};
use crate::state::{Event, State, StateCell};
use crate::stats::{ReportSink, StatsPipeline, StatsRecorder};
use crate::task::{Task, TaskSet};

/// Refill period of the per-run request limiter
const LIMITER_REFILL_PERIOD: Duration = Duration::from_secs(1);

/// Callbacks a runner receives from its run
pub(crate) trait RunHooks: Send + Sync {
    /// The ramp reached its target
    fn spawn_complete(&self, _user_count: i64) {}

    /// A task panicked and was recovered
    fn task_panicked(&self, _error: &str) {}

    /// The run finished stopping
    fn stopped(&self) {}
}

/// Hooks that ignore every callback
pub(crate) struct NoHooks;

impl RunHooks for NoHooks {}

/// Everything that lives for exactly one run
pub(crate) struct RunContext {
    pub(crate) profile: Profile,
    pub(crate) controller: Controller,
    tasks: TaskSet,
    loop_quota: Option<LoopQuota>,
    limiter: Option<Arc<dyn RateLimiter>>,
    stopping: CancellationToken,
    tracker: TaskTracker,
    stats_done: CancellationToken,
    stats_task: Mutex<Option<JoinHandle<()>>>,
    finished: CancellationToken,
    hooks: Arc<dyn RunHooks>,
    started: Instant,
}

impl RunContext {
    /// Resolves once the run has fully stopped and flushed its stats
    pub(crate) async fn finished(&self) {
        self.finished.cancelled().await;
    }

    pub(crate) fn loop_quota(&self) -> Option<&LoopQuota> {
        self.loop_quota.as_ref()
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("profile", &self.profile)
            .field("controller", &self.controller)
            .field("tasks", &self.tasks.len())
            .field("loop_quota", &self.loop_quota)
            .field("stopping", &self.stopping.is_cancelled())
            .field("finished", &self.finished.is_cancelled())
            .finish()
    }
}

enum UserExit {
    Stopped,
    Erased,
    QuotaExhausted,
    LoopFinished,
}

/// One node's users, state and stats
pub(crate) struct RunnerCore {
    state: StateCell,
    stats: StatsPipeline,
    run: Mutex<Option<Arc<RunContext>>>,
}

impl RunnerCore {
    pub(crate) fn new(channel_config: &ChannelConfig) -> Self {
        Self {
            state: StateCell::new(State::Init),
            stats: StatsPipeline::new(channel_config),
            run: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state.get()
    }

    pub(crate) fn apply(&self, event: Event) -> SwarmResult<State> {
        self.state.apply(event)
    }

    pub(crate) fn recorder(&self) -> &StatsRecorder {
        self.stats.recorder()
    }

    pub(crate) fn current_run(&self) -> Option<Arc<RunContext>> {
        self.run.lock().clone()
    }

    /// Users running in the current run
    pub(crate) fn user_count(&self) -> i64 {
        self.current_run()
            .map(|run| run.controller.current_clients())
            .unwrap_or(0)
    }

    /// Start a run: validate, move to Spawning, and launch the ramp
    pub(crate) fn start(
        self: &Arc<Self>,
        profile: Profile,
        tasks: Vec<Task>,
        sink: Arc<dyn ReportSink>,
        hooks: Arc<dyn RunHooks>,
    ) -> SwarmResult<Arc<RunContext>> {
        profile.validate()?;
        if tasks.is_empty() {
            return Err(SwarmError::config("no tasks to run"));
        }
        let limiter = build_limiter(&profile)?;
        self.state.apply(Event::Start)?;

        if let Some(limiter) = &limiter {
            limiter.start();
        }

        let run = Arc::new(RunContext {
            controller: Controller::new(profile.spawn_count, profile.spawn_rate),
            tasks: TaskSet::new(tasks),
            loop_quota: profile.loop_count().map(LoopQuota::new),
            limiter,
            stopping: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stats_done: CancellationToken::new(),
            stats_task: Mutex::new(None),
            finished: CancellationToken::new(),
            hooks,
            started: Instant::now(),
            profile,
        });
        *self.run.lock() = Some(Arc::clone(&run));

        tracing::info!(
            spawn_count = run.profile.spawn_count,
            spawn_rate = run.profile.spawn_rate,
            run_time = run.profile.run_time,
            max_rps = run.profile.max_rps,
            loop_count = run.profile.loop_count,
            tasks = run.tasks.len(),
            "Starting run"
        );

        let probe_core = Arc::clone(self);
        let probe_run = Arc::clone(&run);
        let stats_task = self.stats.spawn_aggregator(
            run.stats_done.clone(),
            move || (probe_run.controller.current_clients(), probe_core.state()),
            sink,
        );
        *run.stats_task.lock() = Some(stats_task);

        let core = Arc::clone(self);
        let spawner_run = Arc::clone(&run);
        run.tracker.spawn(async move {
            let run = spawner_run;
            let launch = {
                let core = Arc::clone(&core);
                let run = Arc::clone(&run);
                move || {
                    let quota = run
                        .loop_quota
                        .as_ref()
                        .map(|quota| quota.per_user(run.controller.spawn_count()));
                    run.tracker
                        .spawn(Arc::clone(&core).run_user(Arc::clone(&run), quota));
                }
            };
            run.controller
                .spawn_workers(run.stopping.clone(), launch, || core.on_spawn_complete(&run))
                .await;
        });

        if let Some(run_time) = run.profile.run_time() {
            let core = Arc::clone(self);
            let watched = Arc::clone(&run);
            tokio::spawn(async move {
                tokio::select! {
                    _ = watched.stopping.cancelled() => {}
                    _ = tokio::time::sleep(run_time) => {
                        tracing::info!(run_time_secs = run_time.as_secs(), "Run time limit reached");
                        if let Err(e) = core.stop_run(&watched).await {
                            tracing::warn!(error = %e, "Stop after run time failed");
                        }
                    }
                }
            });
        }

        Ok(run)
    }

    fn on_spawn_complete(&self, run: &RunContext) {
        let user_count = run.controller.current_clients();
        match self.state.apply(Event::SpawnComplete) {
            Ok(_) => {
                tracing::info!(
                    user_count,
                    elapsed_ms = run.started.elapsed().as_millis() as u64,
                    "All users spawned"
                );
                run.hooks.spawn_complete(user_count);
            }
            Err(e) => tracing::debug!(error = %e, "Spawn completed outside of spawning"),
        }
    }

    /// Re-target the current run without restarting it
    pub(crate) fn rebalance(&self, profile: &Profile) -> SwarmResult<()> {
        let run = self
            .current_run()
            .ok_or_else(|| SwarmError::config("no run to rebalance"))?;
        self.state.apply(Event::Rebalance)?;
        tracing::info!(
            spawn_count = profile.spawn_count,
            spawn_rate = profile.spawn_rate,
            "Rebalancing run"
        );
        run.controller.set_spawn(profile.spawn_count, profile.spawn_rate);
        Ok(())
    }

    /// Stop the current run, if any, and wait until it has fully stopped
    ///
    /// When another caller is already stopping the run, this waits for that
    /// stop to finish.
    pub(crate) async fn stop(&self) -> SwarmResult<()> {
        let Some(run) = self.current_run() else {
            return Ok(());
        };
        self.stop_run(&run).await?;
        if run.stopping.is_cancelled() {
            run.finished().await;
        }
        Ok(())
    }

    /// Stop `run` if it is still the current one
    ///
    /// Only the caller that moves the state to Stopping does the work; others
    /// return immediately.
    async fn stop_run(&self, run: &Arc<RunContext>) -> SwarmResult<()> {
        let is_current = self
            .run
            .lock()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, run));
        if !is_current {
            return Ok(());
        }
        if let Err(e) = self.state.apply(Event::Stop) {
            tracing::debug!(error = %e, "Stop ignored");
            return Ok(());
        }

        tracing::info!(user_count = run.controller.current_clients(), "Stopping run");
        run.stopping.cancel();
        run.tracker.close();
        run.tracker.wait().await;

        if let Some(limiter) = &run.limiter {
            limiter.stop();
        }

        run.stats_done.cancel();
        let stats_task = run.stats_task.lock().take();
        if let Some(handle) = stats_task {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Stats aggregator failed");
            }
        }

        // Waiters on `finished` are released even if the state moved on.
        let stopped = self.state.apply(Event::Stopped);
        tracing::info!(
            elapsed_ms = run.started.elapsed().as_millis() as u64,
            "Run stopped"
        );
        run.hooks.stopped();
        run.finished.cancel();
        stopped.map(|_| ())
    }

    async fn run_user(self: Arc<Self>, run: Arc<RunContext>, quota: Option<i64>) {
        let mut remaining = quota;
        tracing::debug!(quota = ?quota, "User started");

        let exit = loop {
            if run.stopping.is_cancelled() {
                break UserExit::Stopped;
            }
            if run.controller.erase() {
                break UserExit::Erased;
            }
            if remaining == Some(0) {
                break UserExit::QuotaExhausted;
            }
            if let Some(limiter) = &run.limiter {
                if !admit(limiter.as_ref(), &run.stopping).await {
                    break UserExit::Stopped;
                }
            }
            if let Some(loop_quota) = &run.loop_quota {
                if !loop_quota.acquire() {
                    break UserExit::QuotaExhausted;
                }
            }

            if let Some(task) = run.tasks.pick() {
                self.safe_run(&run, task).await;
            }

            if let Some(left) = remaining.as_mut() {
                *left -= 1;
            }
            if let Some(loop_quota) = &run.loop_quota {
                loop_quota.finish();
                if loop_quota.is_finished() {
                    break UserExit::LoopFinished;
                }
            }
        };

        if matches!(exit, UserExit::Erased) {
            tracing::debug!("User shed after rebalance");
            return;
        }

        let users_left = run.controller.release();
        let drained = matches!(exit, UserExit::QuotaExhausted)
            && run.loop_quota.is_some()
            && users_left == 0
            && run.controller.is_spawn_complete();

        if matches!(exit, UserExit::LoopFinished) || drained {
            tracing::info!(
                finished = run.loop_quota.as_ref().map(LoopQuota::finished),
                "Loop count reached"
            );
            // The stop waits on this user's tracker, so it cannot run inline.
            let core = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = core.stop_run(&run).await {
                    tracing::warn!(error = %e, "Stop after loop count failed");
                }
            });
        }
    }

    async fn safe_run(&self, run: &RunContext, task: &Task) {
        let outcome = AssertUnwindSafe(async { task.call().await })
            .catch_unwind()
            .await;
        if let Err(panic) = outcome {
            let error = panic_message(panic.as_ref());
            tracing::error!(task = task.name(), error = %error, "Task panicked");
            self.stats
                .recorder()
                .record_failure("unknown", "panic", 0, error.clone())
                .await;
            run.hooks.task_panicked(&error);
        }
    }
}

async fn admit(limiter: &dyn RateLimiter, stopping: &CancellationToken) -> bool {
    loop {
        tokio::select! {
            biased;
            _ = stopping.cancelled() => return false,
            blocked = limiter.acquire() => if !blocked {
                return true;
            },
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "task panicked".to_string()
}

/// Pick the request limiter for a profile
///
/// Ramp-up takes precedence and is capped at `max_rps` when one is set; a
/// bare `max_rps` gives a stable limiter; otherwise requests are unlimited.
pub(crate) fn build_limiter(profile: &Profile) -> SwarmResult<Option<Arc<dyn RateLimiter>>> {
    if profile.ramp_up_enabled() {
        let limiter = RampUpRateLimiter::new(
            profile.max_rps().unwrap_or(i64::MAX),
            &profile.request_increase_rate,
            LIMITER_REFILL_PERIOD,
        )?;
        return Ok(Some(Arc::new(limiter)));
    }
    Ok(profile.max_rps().map(|max_rps| {
        Arc::new(StableRateLimiter::new(max_rps, LIMITER_REFILL_PERIOD)) as Arc<dyn RateLimiter>
    }))
}
