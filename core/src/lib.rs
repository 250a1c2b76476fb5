//! swarm-core: distributed load generation engine
//!
//! This crate provides everything a swarm node needs:
//!
//! - The runner state machine and spawn ramp (local, worker and master)
//! - The master-worker protocol over newline-delimited JSON
//! - Request rate limiting (stable and ramp-up)
//! - Statistics aggregation and report outputs
//!
//! Workloads are opaque: callers hand in [`Task`]s (or a [`TaskFactory`] on
//! workers) and record outcomes through a [`StatsRecorder`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod error;
pub mod node;
pub mod output;
pub mod rate_limiter;
pub mod runner;
pub mod state;
pub mod stats;
pub mod system;
pub mod task;
pub mod transport;

pub use channel::ChannelConfig;
pub use config::{MasterConfig, Profile, WorkerConfig};
pub use error::{SwarmError, SwarmResult};
pub use output::{ConsoleOutput, JsonOutput, Output};
pub use rate_limiter::{RampUpRateLimiter, RateLimiter, StableRateLimiter};
pub use runner::{LocalRunner, LocalRunnerBuilder, MasterRunner, TaskRequest, WorkerRunner};
pub use state::State;
pub use stats::{ReportData, StatsRecorder};
pub use task::{Task, TaskFactory, TaskPayload};
