//! Runners: local, worker and master
//!
//! A run is driven by a fresh [`Controller`] that ramps one tokio task per
//! user toward the target count. Users loop over the task set until the run
//! stops, their loop quota runs out, or a downward rebalance sheds them.
//!
//! - [`LocalRunner`] runs users in this process and reports to its outputs.
//! - [`WorkerRunner`] runs users for a master and streams results back.
//! - [`MasterRunner`] runs no users; it splits the profile across workers
//!   and aggregates what they report.

mod builder;
mod controller;
mod local;
mod master;
mod quota;
mod shared;
mod worker;

pub use builder::LocalRunnerBuilder;
pub use controller::Controller;
pub use local::LocalRunner;
pub use master::{MasterRunner, TaskRequest};
pub use quota::LoopQuota;
pub use worker::WorkerRunner;

#[cfg(test)]
mod tests;
