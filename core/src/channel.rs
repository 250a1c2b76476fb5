//! Channel configuration for the stats pipeline

use std::time::Duration;

/// Buffer and cadence configuration for stats aggregation
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Capacity of each stats event channel (users -> aggregator)
    ///
    /// A full channel blocks the recording user, throttling task execution
    /// until the aggregator catches up.
    pub stats_buffer: usize,

    /// How often aggregated stats are reported
    pub report_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            stats_buffer: 100,
            report_interval: Duration::from_secs(3),
        }
    }
}

impl ChannelConfig {
    /// Set the stats event channel capacity
    pub fn with_stats_buffer(mut self, size: usize) -> Self {
        self.stats_buffer = size.max(1);
        self
    }

    /// Set the report interval
    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }
}
