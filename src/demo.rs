//! Simulated workload so the binary runs end to end
//!
//! The payload is a JSON list of task specs. Each invocation sleeps for a
//! random latency and records a success or a failure; a spec with more than
//! one step also records the steps as one transaction.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use swarm_core::{StatsRecorder, SwarmResult, Task, TaskFactory, TaskPayload};

/// Built-in payload used when no task file is given
pub const DEFAULT_TASKS: &str = r#"[
  {"name": "browse", "weight": 6, "min_ms": 20, "max_ms": 120, "content_length": 2048},
  {"name": "search", "weight": 3, "min_ms": 50, "max_ms": 400, "fail_ratio": 0.02},
  {"name": "checkout", "weight": 1, "min_ms": 80, "max_ms": 250, "steps": 3, "fail_ratio": 0.05}
]"#;

const METHOD: &str = "demo";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct DemoTaskSpec {
    name: String,
    weight: u32,
    min_ms: u64,
    max_ms: u64,
    fail_ratio: f64,
    content_length: i64,
    steps: u32,
}

impl Default for DemoTaskSpec {
    fn default() -> Self {
        Self {
            name: "request".to_string(),
            weight: 1,
            min_ms: 10,
            max_ms: 100,
            fail_ratio: 0.0,
            content_length: 0,
            steps: 1,
        }
    }
}

impl DemoTaskSpec {
    /// One simulated request: (latency, failed)
    fn roll(&self) -> (u64, bool) {
        let mut rng = rand::thread_rng();
        let latency = rng.gen_range(self.min_ms..=self.max_ms.max(self.min_ms));
        let failed = rng.gen_bool(self.fail_ratio.clamp(0.0, 1.0));
        (latency, failed)
    }

    fn into_task(self, recorder: StatsRecorder) -> Task {
        let spec = Arc::new(self);
        Task::new(spec.name.clone(), spec.weight, move || {
            let spec = Arc::clone(&spec);
            let recorder = recorder.clone();
            async move { spec.invoke(&recorder).await }
        })
    }

    async fn invoke(&self, recorder: &StatsRecorder) {
        let steps = self.steps.max(1);
        let mut elapsed = 0;
        let mut passed = true;

        for step in 0..steps {
            let (latency, failed) = self.roll();
            tokio::time::sleep(Duration::from_millis(latency)).await;
            elapsed += latency as i64;

            let name = if steps == 1 {
                self.name.clone()
            } else {
                format!("{}/{}", self.name, step + 1)
            };
            if failed {
                recorder
                    .record_failure(METHOD, name, latency as i64, "simulated failure")
                    .await;
                passed = false;
                break;
            }
            recorder
                .record_success(METHOD, name, latency as i64, self.content_length)
                .await;
        }

        if steps > 1 {
            recorder
                .record_transaction(self.name.as_str(), passed, elapsed, self.content_length)
                .await;
        }
    }
}

/// Builds simulated tasks from a JSON payload
#[derive(Debug, Default)]
pub struct DemoTaskFactory;

impl TaskFactory for DemoTaskFactory {
    fn build(&self, payload: &TaskPayload, recorder: &StatsRecorder) -> SwarmResult<Vec<Task>> {
        let specs: Vec<DemoTaskSpec> = serde_json::from_slice(payload.as_bytes())?;
        tracing::debug!(tasks = specs.len(), "Built demo tasks");
        Ok(specs
            .into_iter()
            .map(|spec| spec.into_task(recorder.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_core::stats::StatsPipeline;
    use swarm_core::ChannelConfig;

    #[test]
    fn test_default_payload_builds() {
        let pipeline = StatsPipeline::new(&ChannelConfig::default());
        let tasks = DemoTaskFactory
            .build(&TaskPayload::new(DEFAULT_TASKS), pipeline.recorder())
            .unwrap();
        let names: Vec<&str> = tasks.iter().map(Task::name).collect();
        assert_eq!(names, vec!["browse", "search", "checkout"]);
        assert_eq!(tasks[0].weight(), 6);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let pipeline = StatsPipeline::new(&ChannelConfig::default());
        let tasks = DemoTaskFactory
            .build(&TaskPayload::new(r#"[{"name": "ping"}]"#), pipeline.recorder())
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].weight(), 1);
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let pipeline = StatsPipeline::new(&ChannelConfig::default());
        let err = DemoTaskFactory
            .build(&TaskPayload::new("not json"), pipeline.recorder())
            .unwrap_err();
        assert!(matches!(err, swarm_core::SwarmError::Serde(_)));
    }

    #[test]
    fn test_roll_stays_in_range() {
        let spec = DemoTaskSpec {
            min_ms: 5,
            max_ms: 7,
            fail_ratio: 1.0,
            ..Default::default()
        };
        for _ in 0..20 {
            let (latency, failed) = spec.roll();
            assert!((5..=7).contains(&latency));
            assert!(failed);
        }
    }
}
