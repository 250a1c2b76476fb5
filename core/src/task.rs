//! Tasks: named, weighted units of repeatable work
//!
//! A [`Task`] wraps an async callback supplied by the caller. A runner keeps
//! its tasks in a [`TaskSet`] and every user picks one per iteration by
//! weighted random selection.

use std::future::Future;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SwarmResult;
use crate::stats::StatsRecorder;

type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A named, weighted unit of work
#[derive(Clone)]
pub struct Task {
    name: String,
    weight: u32,
    func: TaskFn,
}

impl Task {
    /// Create a task from an async closure
    ///
    /// # Example
    /// ```
    /// use swarm_core::Task;
    ///
    /// let task = Task::new("ping", 10, || async {
    ///     // issue a request, record stats...
    /// });
    /// assert_eq!(task.weight(), 10);
    /// ```
    pub fn new<F, Fut>(name: impl Into<String>, weight: u32, func: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            weight,
            func: Arc::new(move || func().boxed()),
        }
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Relative selection weight
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Start one invocation
    pub fn call(&self) -> BoxFuture<'static, ()> {
        (self.func)()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish()
    }
}

/// The tasks of one run with their cumulative weight
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    tasks: Vec<Task>,
    total_weight: u64,
}

impl TaskSet {
    /// Build a set from `tasks`
    pub fn new(tasks: Vec<Task>) -> Self {
        let total_weight = tasks.iter().map(|t| t.weight as u64).sum();
        Self {
            tasks,
            total_weight,
        }
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the set has no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Sum of all weights
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Pick a task, weighted by `weight`; uniform when all weights are zero
    pub fn pick(&self) -> Option<&Task> {
        match self.tasks.len() {
            0 => None,
            1 => self.tasks.first(),
            n => {
                let mut rng = rand::thread_rng();
                if self.total_weight == 0 {
                    return self.tasks.get(rng.gen_range(0..n));
                }
                self.pick_at(rng.gen_range(0..self.total_weight))
            }
        }
    }

    /// Cumulative-weight scan for a point in `0..total_weight`
    fn pick_at(&self, point: u64) -> Option<&Task> {
        let mut running = 0u64;
        self.tasks.iter().find(|task| {
            running += task.weight as u64;
            running > point
        })
    }
}

/// Opaque, serialized task definitions shipped from master to workers
///
/// The bytes are produced by an external task-discovery poller and turned
/// back into [`Task`]s on each worker by a [`TaskFactory`]. On the wire they
/// travel as base64.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPayload(pub Vec<u8>);

impl TaskPayload {
    /// Wrap raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for TaskPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for TaskPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(TaskPayload)
            .map_err(serde::de::Error::custom)
    }
}

/// Builds a worker's tasks from the payload sent by the master
pub trait TaskFactory: Send + Sync {
    /// Build the tasks for one run
    ///
    /// `recorder` is the worker's stats handle; tasks clone it to report
    /// their outcomes.
    fn build(&self, payload: &TaskPayload, recorder: &StatsRecorder) -> SwarmResult<Vec<Task>>;
}
