//! Human-readable table on stdout

use async_trait::async_trait;
use chrono::Local;

use super::Output;
use crate::stats::{ReportData, StatsEntry};

/// Prints each report as a table
#[derive(Debug, Default)]
pub struct ConsoleOutput;

impl ConsoleOutput {
    /// Create a console output
    pub fn new() -> Self {
        Self
    }

    /// Render a report as text
    pub fn render(report: &ReportData) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{} | users: {} | state: {}\n",
            Local::now().format("%Y/%m/%d %H:%M:%S"),
            report.user_count,
            report.state
        ));
        out.push_str(&format!(
            "{:<12} {:<28} {:>9} {:>9} {:>8} {:>9} {:>8} {:>8} {:>10} {:>8} {:>8}\n",
            "Type",
            "Name",
            "# reqs",
            "# fails",
            "Median",
            "Average",
            "Min",
            "Max",
            "Content",
            "reqs/s",
            "fails/s"
        ));
        for entry in &report.stats {
            out.push_str(&row(&entry.method, &entry.name, entry));
        }
        out.push_str(&row("", "Total", &report.stats_total));

        let txn = report.transactions;
        if txn.passed + txn.failed > 0 {
            out.push_str(&format!(
                "Transactions: {} passed, {} failed\n",
                txn.passed, txn.failed
            ));
        }
        if !report.errors.is_empty() {
            out.push_str("Errors:\n");
            for error in report.errors.values() {
                out.push_str(&format!(
                    "  {:>6}x {} {}: {}\n",
                    error.occurrences, error.method, error.name, error.error
                ));
            }
        }
        out
    }
}

fn row(method: &str, name: &str, entry: &StatsEntry) -> String {
    format!(
        "{:<12} {:<28} {:>9} {:>9} {:>8} {:>9.2} {:>8} {:>8} {:>10} {:>8.2} {:>8.2}\n",
        method,
        truncate(name, 28),
        entry.num_requests,
        format!("{}({:.1}%)", entry.num_failures, entry.fail_ratio() * 100.0),
        entry.median_response_time(),
        entry.avg_response_time(),
        entry.min_response_time,
        entry.max_response_time,
        entry.avg_content_length(),
        entry.rps(),
        entry.fail_per_sec()
    )
}

fn truncate(name: &str, width: usize) -> String {
    if name.chars().count() <= width {
        return name.to_string();
    }
    let kept: String = name.chars().take(width.saturating_sub(1)).collect();
    format!("{kept}~")
}

#[async_trait]
impl Output for ConsoleOutput {
    async fn on_start(&self) {
        tracing::info!("Console output started");
    }

    async fn on_event(&self, report: &ReportData) {
        println!("{}", Self::render(report));
    }

    async fn on_stop(&self) {
        tracing::info!("Console output stopped");
    }
}
