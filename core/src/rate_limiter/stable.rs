//! Fixed-threshold rate limiter

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{RateLimiter, TokenBucket};

/// Allows `threshold` task iterations per `refill_period`
#[derive(Debug)]
pub struct StableRateLimiter {
    threshold: i64,
    refill_period: Duration,
    bucket: Arc<TokenBucket>,
    running: Mutex<Option<CancellationToken>>,
}

impl StableRateLimiter {
    /// Create a limiter; call [`RateLimiter::start`] before acquiring
    pub fn new(threshold: i64, refill_period: Duration) -> Self {
        Self {
            threshold,
            refill_period,
            bucket: Arc::new(TokenBucket::new()),
            running: Mutex::new(None),
        }
    }

    /// Tokens per refill period
    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    /// Tokens left in the current period (negative while callers are parked)
    pub fn available(&self) -> i64 {
        self.bucket.available()
    }
}

#[async_trait]
impl RateLimiter for StableRateLimiter {
    fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *running = Some(cancel.clone());
        drop(running);

        self.bucket.fill(self.threshold);

        let bucket = Arc::clone(&self.bucket);
        let threshold = self.threshold;
        let period = self.refill_period;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                bucket.fill(threshold);
                bucket.wake_all();
            }
            tracing::debug!(threshold, "Stable rate limiter stopped");
        });
    }

    async fn acquire(&self) -> bool {
        self.bucket.take().await
    }

    fn stop(&self) {
        if let Some(cancel) = self.running.lock().take() {
            cancel.cancel();
        }
    }
}

impl Drop for StableRateLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}
