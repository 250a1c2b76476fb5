//! Single-writer statistics accumulator

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::entry::{StatsEntry, StatsError};
use crate::state::State;

/// Name of the entry aggregating every request
pub const TOTAL: &str = "Total";

/// Method used for transaction entries
pub const TRANSACTION_METHOD: &str = "transaction";

/// Passed and failed transaction counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCounts {
    /// Transactions that succeeded
    pub passed: i64,
    /// Transactions that failed
    pub failed: i64,
}

/// One reporting interval's worth of statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportData {
    /// Entries that saw traffic during the interval
    pub stats: Vec<StatsEntry>,
    /// The aggregate of every request during the interval
    pub stats_total: StatsEntry,
    /// Transactions during the interval
    pub transactions: TransactionCounts,
    /// Errors during the interval, keyed by their dedup key
    pub errors: BTreeMap<String, StatsError>,
    /// Users running when the report was taken
    pub user_count: i64,
    /// Runner state when the report was taken
    pub state: State,
}

impl ReportData {
    /// Total requests in this report
    pub fn num_requests(&self) -> i64 {
        self.stats_total.num_requests
    }
}

/// Accumulates completion events into per-(name, method) entries
///
/// Owned by exactly one aggregation task; nothing here is synchronized.
#[derive(Debug)]
pub struct RequestStats {
    entries: HashMap<(String, String), StatsEntry>,
    errors: BTreeMap<String, StatsError>,
    total: StatsEntry,
    transactions: TransactionCounts,
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestStats {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            errors: BTreeMap::new(),
            total: StatsEntry::new(TOTAL, ""),
            transactions: TransactionCounts::default(),
        }
    }

    fn entry(&mut self, name: &str, method: &str) -> &mut StatsEntry {
        self.entries
            .entry((name.to_string(), method.to_string()))
            .or_insert_with(|| StatsEntry::new(name, method))
    }

    /// Entry for `(name, method)`, if anything was logged for it
    pub fn get(&self, name: &str, method: &str) -> Option<&StatsEntry> {
        self.entries.get(&(name.to_string(), method.to_string()))
    }

    /// The aggregate entry
    pub fn total(&self) -> &StatsEntry {
        &self.total
    }

    /// Errors seen since the last report
    pub fn errors(&self) -> &BTreeMap<String, StatsError> {
        &self.errors
    }

    /// Transaction counts since the last report
    pub fn transactions(&self) -> TransactionCounts {
        self.transactions
    }

    /// Log a completed request
    pub fn log_request(&mut self, method: &str, name: &str, response_time: i64, content_length: i64) {
        self.total.log(response_time, content_length);
        self.entry(name, method).log(response_time, content_length);
    }

    /// Log a failure; identical (method, name, error) triples are counted once
    pub fn log_error(&mut self, method: &str, name: &str, error: &str) {
        self.total.log_error();
        self.entry(name, method).log_error();

        self.errors
            .entry(error_key(method, name, error))
            .or_insert_with(|| StatsError {
                name: name.to_string(),
                method: method.to_string(),
                error: error.to_string(),
                occurrences: 0,
            })
            .occurrences += 1;
    }

    /// Log a transaction; it gets its own entry and never touches the total
    pub fn log_transaction(&mut self, name: &str, success: bool, elapsed: i64, content_size: i64) {
        let entry = self.entry(name, TRANSACTION_METHOD);
        entry.log(elapsed, content_size);
        if success {
            self.transactions.passed += 1;
        } else {
            entry.log_error();
            self.transactions.failed += 1;
        }
    }

    /// Fold a report from another node into this accumulator
    pub fn merge(&mut self, report: &ReportData) {
        for incoming in &report.stats {
            self.entry(&incoming.name, &incoming.method).extend(incoming);
        }
        self.total.extend(&report.stats_total);
        self.transactions.passed += report.transactions.passed;
        self.transactions.failed += report.transactions.failed;
        for (key, incoming) in &report.errors {
            self.errors
                .entry(key.clone())
                .and_modify(|existing| existing.occurrences += incoming.occurrences)
                .or_insert_with(|| incoming.clone());
        }
    }

    /// Take the report for the interval that just ended
    ///
    /// Every non-idle entry and the total are snapshotted and reset; the
    /// error map and transaction counts are cleared.
    pub fn collect_report_data(&mut self, user_count: i64, state: State) -> ReportData {
        let mut stats: Vec<StatsEntry> = self
            .entries
            .values_mut()
            .filter(|entry| !entry.is_idle())
            .map(StatsEntry::take_report)
            .collect();
        stats.sort_by(|a, b| (&a.name, &a.method).cmp(&(&b.name, &b.method)));

        ReportData {
            stats,
            stats_total: self.total.take_report(),
            transactions: std::mem::take(&mut self.transactions),
            errors: std::mem::take(&mut self.errors),
            user_count,
            state,
        }
    }

    /// Drop every entry, error and count
    pub fn clear_all(&mut self) {
        *self = Self::new();
    }
}

/// Dedup key for an error: hex SHA-256 of method, name and error text
pub fn error_key(method: &str, name: &str, error: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\0");
    hasher.update(name.as_bytes());
    hasher.update(b"\0");
    hasher.update(error.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
