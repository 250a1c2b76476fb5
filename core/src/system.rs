//! Host and process metrics reported in heartbeats

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Samples this process's CPU and memory usage
pub struct SystemMonitor {
    system: System,
    pid: Option<Pid>,
}

impl SystemMonitor {
    /// Create a monitor for the current process
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| tracing::warn!(error = %e, "Cannot resolve own pid, usage will read 0"))
            .ok();
        Self {
            system: System::new(),
            pid,
        }
    }

    /// Refresh and return (CPU percent, resident memory in MiB)
    ///
    /// CPU usage is measured between two calls, so the first sample reads 0.
    pub fn sample(&mut self) -> (f64, f64) {
        let Some(pid) = self.pid else {
            return (0.0, 0.0);
        };
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match self.system.process(pid) {
            Some(process) => (
                f64::from(process.cpu_usage()),
                process.memory() as f64 / (1024.0 * 1024.0),
            ),
            None => (0.0, 0.0),
        }
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemMonitor").field("pid", &self.pid).finish()
    }
}

/// Host name, or `"unknown"`
pub fn host_name() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

/// Generate a node id from the host name and a random UUID
pub fn generate_node_id() -> String {
    format!("{}_{}", host_name(), uuid::Uuid::new_v4().simple())
}
