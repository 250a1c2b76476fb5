//! Statistics pipeline
//!
//! Users never touch aggregated statistics. They enqueue immutable events
//! through a [`StatsRecorder`]; one aggregation task per run owns the
//! [`RequestStats`] and is the only writer. The event channels are bounded,
//! so a stalled aggregator slows task execution down instead of growing
//! memory.
//!
//! ```text
//! user ──record_success──┐
//! user ──record_failure──┼──► aggregator ──every interval──► ReportSink
//! user ──record_txn──────┤        (RequestStats)
//! worker reports ────────┘ (master only)
//! ```

mod collector;
mod entry;

pub use collector::{
    error_key, ReportData, RequestStats, TransactionCounts, TOTAL, TRANSACTION_METHOD,
};
pub use entry::{round_response_time, StatsEntry, StatsError};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelConfig;
use crate::state::State;

/// A request that completed successfully
#[derive(Debug, Clone)]
pub struct RequestSuccess {
    /// Request method or category
    pub method: String,
    /// Request name
    pub name: String,
    /// Response time in milliseconds
    pub response_time: i64,
    /// Response content length in bytes
    pub content_length: i64,
}

/// A request that failed
#[derive(Debug, Clone)]
pub struct RequestFailure {
    /// Request method or category
    pub method: String,
    /// Request name
    pub name: String,
    /// Response time in milliseconds
    pub response_time: i64,
    /// Error text
    pub error: String,
}

/// A completed multi-request transaction
#[derive(Debug, Clone)]
pub struct TransactionEvent {
    /// Transaction name
    pub name: String,
    /// Whether the transaction passed
    pub success: bool,
    /// Elapsed time in milliseconds
    pub elapsed: i64,
    /// Total content size in bytes
    pub content_size: i64,
}

/// Cloneable handle tasks use to report outcomes
///
/// Every call waits for room in a bounded channel.
#[derive(Debug, Clone)]
pub struct StatsRecorder {
    success: mpsc::Sender<RequestSuccess>,
    failure: mpsc::Sender<RequestFailure>,
    transaction: mpsc::Sender<TransactionEvent>,
}

impl StatsRecorder {
    /// Record a successful request
    pub async fn record_success(
        &self,
        method: impl Into<String>,
        name: impl Into<String>,
        response_time: i64,
        content_length: i64,
    ) {
        let event = RequestSuccess {
            method: method.into(),
            name: name.into(),
            response_time,
            content_length,
        };
        if self.success.send(event).await.is_err() {
            tracing::debug!("Stats channel closed, dropping success");
        }
    }

    /// Record a failed request
    pub async fn record_failure(
        &self,
        method: impl Into<String>,
        name: impl Into<String>,
        response_time: i64,
        error: impl Into<String>,
    ) {
        let event = RequestFailure {
            method: method.into(),
            name: name.into(),
            response_time,
            error: error.into(),
        };
        if self.failure.send(event).await.is_err() {
            tracing::debug!("Stats channel closed, dropping failure");
        }
    }

    /// Record a transaction
    pub async fn record_transaction(
        &self,
        name: impl Into<String>,
        success: bool,
        elapsed: i64,
        content_size: i64,
    ) {
        let event = TransactionEvent {
            name: name.into(),
            success,
            elapsed,
            content_size,
        };
        if self.transaction.send(event).await.is_err() {
            tracing::debug!("Stats channel closed, dropping transaction");
        }
    }
}

/// Where aggregated reports go
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Deliver one report
    async fn publish(&self, report: ReportData);
}

struct StatsReceivers {
    success: mpsc::Receiver<RequestSuccess>,
    failure: mpsc::Receiver<RequestFailure>,
    transaction: mpsc::Receiver<TransactionEvent>,
    reports: mpsc::Receiver<ReportData>,
}

impl StatsReceivers {
    fn drain_into(&mut self, stats: &mut RequestStats) {
        while let Ok(event) = self.success.try_recv() {
            apply_success(stats, event);
        }
        while let Ok(event) = self.failure.try_recv() {
            apply_failure(stats, event);
        }
        while let Ok(event) = self.transaction.try_recv() {
            apply_transaction(stats, event);
        }
        while let Ok(report) = self.reports.try_recv() {
            stats.merge(&report);
        }
    }
}

fn apply_success(stats: &mut RequestStats, event: RequestSuccess) {
    stats.log_request(&event.method, &event.name, event.response_time, event.content_length);
}

fn apply_failure(stats: &mut RequestStats, event: RequestFailure) {
    stats.log_request(&event.method, &event.name, event.response_time, 0);
    stats.log_error(&event.method, &event.name, &event.error);
}

fn apply_transaction(stats: &mut RequestStats, event: TransactionEvent) {
    stats.log_transaction(&event.name, event.success, event.elapsed, event.content_size);
}

/// The channels of one runner and the means to aggregate them
///
/// The channels outlive individual runs, so a [`StatsRecorder`] handed to a
/// task factory stays valid across restarts. Each run spawns its own
/// aggregation task with fresh [`RequestStats`].
pub struct StatsPipeline {
    recorder: StatsRecorder,
    forward: mpsc::Sender<ReportData>,
    receivers: Arc<Mutex<StatsReceivers>>,
    report_interval: Duration,
}

impl StatsPipeline {
    /// Create the channels
    pub fn new(config: &ChannelConfig) -> Self {
        let capacity = config.stats_buffer.max(1);
        let (success_tx, success_rx) = mpsc::channel(capacity);
        let (failure_tx, failure_rx) = mpsc::channel(capacity);
        let (transaction_tx, transaction_rx) = mpsc::channel(capacity);
        let (forward_tx, forward_rx) = mpsc::channel(capacity);

        Self {
            recorder: StatsRecorder {
                success: success_tx,
                failure: failure_tx,
                transaction: transaction_tx,
            },
            forward: forward_tx,
            receivers: Arc::new(Mutex::new(StatsReceivers {
                success: success_rx,
                failure: failure_rx,
                transaction: transaction_rx,
                reports: forward_rx,
            })),
            report_interval: config.report_interval,
        }
    }

    /// Handle for recording events
    pub fn recorder(&self) -> &StatsRecorder {
        &self.recorder
    }

    /// Sender for reports received from other nodes
    pub(crate) fn forwarder(&self) -> mpsc::Sender<ReportData> {
        self.forward.clone()
    }

    /// Spawn the aggregation task for one run
    ///
    /// `probe` supplies the user count and state stamped on each report. The
    /// task publishes every report interval until `done` is cancelled, then
    /// drains whatever is queued and publishes one last report.
    pub(crate) fn spawn_aggregator<P>(
        &self,
        done: CancellationToken,
        probe: P,
        sink: Arc<dyn ReportSink>,
    ) -> JoinHandle<()>
    where
        P: Fn() -> (i64, State) + Send + 'static,
    {
        let receivers = Arc::clone(&self.receivers);
        let interval = self.report_interval;
        tokio::spawn(async move {
            let guard = receivers.lock_owned().await;
            aggregate(guard, interval, done, probe, sink).await;
        })
    }
}

impl std::fmt::Debug for StatsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsPipeline")
            .field("report_interval", &self.report_interval)
            .finish()
    }
}

async fn aggregate<P>(
    mut rx: OwnedMutexGuard<StatsReceivers>,
    interval: Duration,
    done: CancellationToken,
    probe: P,
    sink: Arc<dyn ReportSink>,
) where
    P: Fn() -> (i64, State),
{
    let mut stats = RequestStats::new();
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(interval_ms = interval.as_millis() as u64, "Stats aggregator started");

    loop {
        let rx = &mut *rx;
        tokio::select! {
            biased;

            _ = done.cancelled() => break,

            _ = ticker.tick() => {
                let (user_count, state) = probe();
                sink.publish(stats.collect_report_data(user_count, state)).await;
            }

            Some(event) = rx.success.recv() => apply_success(&mut stats, event),
            Some(event) = rx.failure.recv() => apply_failure(&mut stats, event),
            Some(event) = rx.transaction.recv() => apply_transaction(&mut stats, event),
            Some(report) = rx.reports.recv() => stats.merge(&report),
        }
    }

    rx.drain_into(&mut stats);
    let (user_count, state) = probe();
    let last = stats.collect_report_data(user_count, state);
    tracing::debug!(
        requests = last.num_requests(),
        "Stats aggregator flushing final report"
    );
    sink.publish(last).await;
}
