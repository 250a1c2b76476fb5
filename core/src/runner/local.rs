//! Single-process runner

use std::sync::Arc;

use crate::config::Profile;
use crate::error::SwarmResult;
use crate::output::Outputs;
use crate::state::State;
use crate::stats::StatsRecorder;
use crate::task::Task;

use super::builder::LocalRunnerBuilder;
use super::shared::{NoHooks, RunnerCore};

/// Runs users in this process and reports to its outputs
pub struct LocalRunner {
    core: Arc<RunnerCore>,
    profile: Profile,
    tasks: Vec<Task>,
    outputs: Outputs,
}

impl LocalRunner {
    pub(crate) fn new(core: Arc<RunnerCore>, profile: Profile, tasks: Vec<Task>, outputs: Outputs) -> Self {
        Self {
            core,
            profile,
            tasks,
            outputs,
        }
    }

    /// Start building a runner
    pub fn builder() -> LocalRunnerBuilder {
        LocalRunnerBuilder::new()
    }

    /// Handle for tasks to record their outcomes
    pub fn recorder(&self) -> &StatsRecorder {
        self.core.recorder()
    }

    /// Add a task to the rotation used by the next run
    pub fn add_task(&mut self, task: Task) {
        self.tasks.push(task);
    }

    /// Run profile
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Current state
    pub fn state(&self) -> State {
        self.core.state()
    }

    /// Users currently running
    pub fn user_count(&self) -> i64 {
        self.core.user_count()
    }

    /// Run until the profile's run time or loop count is exhausted, or
    /// until [`stop`](Self::stop) is called
    pub async fn run(&self) -> SwarmResult<()> {
        self.outputs.on_start().await;

        let run = match self.core.start(
            self.profile.clone(),
            self.tasks.clone(),
            Arc::new(self.outputs.clone()),
            Arc::new(NoHooks),
        ) {
            Ok(run) => run,
            Err(e) => {
                self.outputs.on_stop().await;
                return Err(e);
            }
        };

        run.finished().await;
        self.outputs.on_stop().await;
        Ok(())
    }

    /// Run, stopping gracefully on Ctrl+C
    pub async fn run_with_signal_handling(&self) -> SwarmResult<()> {
        let run = self.run();
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result,
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => tracing::info!("Received Ctrl+C, initiating graceful shutdown..."),
                Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C"),
            },
        }

        self.stop().await?;
        run.await
    }

    /// Stop the current run and wait for its users to drain
    pub async fn stop(&self) -> SwarmResult<()> {
        self.core.stop().await
    }
}

impl std::fmt::Debug for LocalRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRunner")
            .field("profile", &self.profile)
            .field("tasks", &self.tasks.len())
            .field("outputs", &self.outputs)
            .field("state", &self.core.state())
            .finish()
    }
}
