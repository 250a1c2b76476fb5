//! Builder pattern for LocalRunner construction

use std::sync::Arc;

use crate::channel::ChannelConfig;
use crate::config::Profile;
use crate::error::SwarmResult;
use crate::output::{Output, Outputs};
use crate::task::{TaskFactory, TaskPayload};

use super::local::LocalRunner;
use super::shared::RunnerCore;

/// Builder for creating a LocalRunner with proper configuration
///
/// # Example
///
/// ```ignore
/// let mut runner = LocalRunnerBuilder::new()
///     .profile(Profile::new(10, 5.0).with_run_time(60))
///     .output(Arc::new(ConsoleOutput::new()))
///     .build()?;
///
/// let recorder = runner.recorder().clone();
/// runner.add_task(Task::new("ping", 1, move || {
///     let recorder = recorder.clone();
///     async move { recorder.record_success("tcp", "ping", 3, 0).await }
/// }));
/// runner.run().await?;
/// ```
pub struct LocalRunnerBuilder {
    profile: Profile,
    channel_config: ChannelConfig,
    outputs: Outputs,
    task_factory: Option<(Arc<dyn TaskFactory>, TaskPayload)>,
}

impl LocalRunnerBuilder {
    /// Create a new builder with the default profile
    pub fn new() -> Self {
        Self {
            profile: Profile::default(),
            channel_config: ChannelConfig::default(),
            outputs: Outputs::new(),
            task_factory: None,
        }
    }

    /// Set the full run profile
    pub fn profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    /// Set the target user count
    pub fn spawn_count(mut self, spawn_count: i64) -> Self {
        self.profile.spawn_count = spawn_count;
        self
    }

    /// Set the users started per second
    pub fn spawn_rate(mut self, spawn_rate: f64) -> Self {
        self.profile.spawn_rate = spawn_rate;
        self
    }

    /// Set the channel configuration
    pub fn channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }

    /// Register an output
    pub fn output(mut self, output: Arc<dyn Output>) -> Self {
        self.outputs.push(output);
        self
    }

    /// Build the tasks from a payload with `factory`
    pub fn task_factory(mut self, factory: Arc<dyn TaskFactory>, payload: TaskPayload) -> Self {
        self.task_factory = Some((factory, payload));
        self
    }

    /// Build the runner
    ///
    /// # Errors
    ///
    /// Returns an error if the profile is invalid or the task factory rejects
    /// its payload.
    pub fn build(self) -> SwarmResult<LocalRunner> {
        self.profile.validate()?;

        let core = Arc::new(RunnerCore::new(&self.channel_config));
        let tasks = match &self.task_factory {
            Some((factory, payload)) => factory.build(payload, core.recorder())?,
            None => Vec::new(),
        };

        Ok(LocalRunner::new(core, self.profile, tasks, self.outputs))
    }
}

impl Default for LocalRunnerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
