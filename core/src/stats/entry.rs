//! Per-(name, method) statistics entries

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Round a response time (milliseconds) into its histogram bucket
///
/// Exact below 100ms, then to the nearest 10, 100 and 1000 for each further
/// order of magnitude. Halves round up.
pub fn round_response_time(response_time: i64) -> i64 {
    match response_time {
        t if t < 100 => t,
        t if t < 1_000 => (t + 5) / 10 * 10,
        t if t < 10_000 => (t + 50) / 100 * 100,
        t => (t + 500) / 1_000 * 1_000,
    }
}

/// Aggregated statistics for one (name, method) pair
///
/// Times are milliseconds; `start_time` and `last_request_timestamp` are Unix
/// milliseconds; per-second maps are keyed by Unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsEntry {
    /// Request name
    pub name: String,
    /// Request method or category
    pub method: String,
    /// Completed requests, failures included
    pub num_requests: i64,
    /// Failed requests
    pub num_failures: i64,
    /// Sum of all response times
    pub total_response_time: i64,
    /// Smallest response time seen (0 before the first request)
    pub min_response_time: i64,
    /// Largest response time seen
    pub max_response_time: i64,
    /// Rounded response time histogram
    pub response_times: BTreeMap<i64, i64>,
    /// Requests per Unix second
    pub num_reqs_per_sec: BTreeMap<i64, i64>,
    /// Failures per Unix second
    pub num_fail_per_sec: BTreeMap<i64, i64>,
    /// Sum of response content lengths
    pub total_content_length: i64,
    /// When this entry was created or last reset
    pub start_time: i64,
    /// When the last request was logged
    pub last_request_timestamp: i64,
}

impl StatsEntry {
    /// Create an empty entry
    pub fn new(name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: method.into(),
            num_requests: 0,
            num_failures: 0,
            total_response_time: 0,
            min_response_time: 0,
            max_response_time: 0,
            response_times: BTreeMap::new(),
            num_reqs_per_sec: BTreeMap::new(),
            num_fail_per_sec: BTreeMap::new(),
            total_content_length: 0,
            start_time: Utc::now().timestamp_millis(),
            last_request_timestamp: 0,
        }
    }

    /// Clear all counters and restart the clock
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.name), std::mem::take(&mut self.method));
    }

    /// Whether nothing was logged since the last reset
    pub fn is_idle(&self) -> bool {
        self.num_requests == 0 && self.num_failures == 0
    }

    /// Log one completed request
    pub fn log(&mut self, response_time: i64, content_length: i64) {
        self.log_at(Utc::now().timestamp_millis(), response_time, content_length);
    }

    pub(crate) fn log_at(&mut self, now_ms: i64, response_time: i64, content_length: i64) {
        self.num_requests += 1;
        *self.num_reqs_per_sec.entry(now_ms.div_euclid(1000)).or_default() += 1;
        self.last_request_timestamp = now_ms;

        self.total_response_time += response_time;
        if self.min_response_time == 0 || response_time < self.min_response_time {
            self.min_response_time = response_time;
        }
        self.max_response_time = self.max_response_time.max(response_time);
        *self
            .response_times
            .entry(round_response_time(response_time))
            .or_default() += 1;

        self.total_content_length += content_length;
    }

    /// Log one failure
    pub fn log_error(&mut self) {
        self.num_failures += 1;
        let second = Utc::now().timestamp();
        *self.num_fail_per_sec.entry(second).or_default() += 1;
    }

    /// Merge another entry for the same key into this one
    pub fn extend(&mut self, other: &StatsEntry) {
        if other.is_idle() {
            return;
        }
        self.num_requests += other.num_requests;
        self.num_failures += other.num_failures;
        self.total_response_time += other.total_response_time;
        self.total_content_length += other.total_content_length;
        self.max_response_time = self.max_response_time.max(other.max_response_time);
        if other.min_response_time > 0
            && (self.min_response_time == 0 || other.min_response_time < self.min_response_time)
        {
            self.min_response_time = other.min_response_time;
        }
        self.start_time = self.start_time.min(other.start_time);
        self.last_request_timestamp = self.last_request_timestamp.max(other.last_request_timestamp);

        for (bucket, count) in &other.response_times {
            *self.response_times.entry(*bucket).or_default() += count;
        }
        for (second, count) in &other.num_reqs_per_sec {
            *self.num_reqs_per_sec.entry(*second).or_default() += count;
        }
        for (second, count) in &other.num_fail_per_sec {
            *self.num_fail_per_sec.entry(*second).or_default() += count;
        }
    }

    /// Snapshot the entry and reset it
    pub fn take_report(&mut self) -> StatsEntry {
        let report = self.clone();
        self.reset();
        report
    }

    /// Average response time
    pub fn avg_response_time(&self) -> f64 {
        if self.num_requests == 0 {
            return 0.0;
        }
        self.total_response_time as f64 / self.num_requests as f64
    }

    /// Median of the rounded response times
    pub fn median_response_time(&self) -> i64 {
        self.percentile(0.5)
    }

    /// Response time below which `percent` (0.0..=1.0) of requests fall
    pub fn percentile(&self, percent: f64) -> i64 {
        let wanted = (self.num_requests as f64 * percent) as i64;
        let mut processed = 0;
        for (bucket, count) in self.response_times.iter().rev() {
            processed += count;
            if self.num_requests - processed <= wanted {
                return *bucket;
            }
        }
        0
    }

    /// Average content length
    pub fn avg_content_length(&self) -> i64 {
        if self.num_requests == 0 {
            return 0;
        }
        self.total_content_length / self.num_requests
    }

    /// Seconds covered by this entry, at least one
    fn elapsed_secs(&self) -> f64 {
        let elapsed_ms = self.last_request_timestamp - self.start_time;
        (elapsed_ms as f64 / 1000.0).max(1.0)
    }

    /// Requests per second over the entry's lifetime
    pub fn rps(&self) -> f64 {
        self.num_requests as f64 / self.elapsed_secs()
    }

    /// Failures per second over the entry's lifetime
    pub fn fail_per_sec(&self) -> f64 {
        self.num_failures as f64 / self.elapsed_secs()
    }

    /// Failures as a fraction of requests
    pub fn fail_ratio(&self) -> f64 {
        if self.num_requests == 0 {
            return if self.num_failures > 0 { 1.0 } else { 0.0 };
        }
        self.num_failures as f64 / self.num_requests as f64
    }
}

/// A deduplicated error with its occurrence count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsError {
    /// Request name
    pub name: String,
    /// Request method
    pub method: String,
    /// Error text
    pub error: String,
    /// Times this exact error was seen
    pub occurrences: i64,
}
