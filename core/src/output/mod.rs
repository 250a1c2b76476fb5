//! Report sinks for local and master runs
//!
//! Every registered [`Output`] sees `on_start` once before the first report,
//! `on_event` for each report, and `on_stop` once after the final report of
//! a run.

mod console;
mod json;

pub use console::ConsoleOutput;
pub use json::JsonOutput;

use std::sync::Arc;

use async_trait::async_trait;

use crate::stats::{ReportData, ReportSink};

/// Receives aggregated reports
#[async_trait]
pub trait Output: Send + Sync {
    /// A run is starting
    async fn on_start(&self) {}

    /// A report interval completed
    async fn on_event(&self, report: &ReportData);

    /// A run finished; no more reports follow
    async fn on_stop(&self) {}
}

/// The outputs registered on a runner
#[derive(Clone, Default)]
pub struct Outputs {
    outputs: Vec<Arc<dyn Output>>,
}

impl Outputs {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an output
    pub fn push(&mut self, output: Arc<dyn Output>) {
        self.outputs.push(output);
    }

    /// Number of registered outputs
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Whether no output is registered
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub(crate) async fn on_start(&self) {
        for output in &self.outputs {
            output.on_start().await;
        }
    }

    pub(crate) async fn on_stop(&self) {
        for output in &self.outputs {
            output.on_stop().await;
        }
    }
}

#[async_trait]
impl ReportSink for Outputs {
    async fn publish(&self, report: ReportData) {
        for output in &self.outputs {
            output.on_event(&report).await;
        }
    }
}

impl std::fmt::Debug for Outputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outputs")
            .field("count", &self.outputs.len())
            .finish()
    }
}
