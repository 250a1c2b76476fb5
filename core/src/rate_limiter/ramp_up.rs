//! Rate limiter whose threshold grows over time

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{parse_ramp_up_rate, RateLimiter, TokenBucket};
use crate::error::SwarmResult;

/// Grows the per-period allowance by `ramp_up_step` every `ramp_up_period`
/// until `max_threshold` is reached
///
/// The allowance that applies to the current refill period is copied from
/// the growing threshold on every refill tick, so a step only takes effect at
/// the next refill.
#[derive(Debug)]
pub struct RampUpRateLimiter {
    max_threshold: i64,
    ramp_up_step: i64,
    ramp_up_period: Duration,
    refill_period: Duration,
    next_threshold: Arc<AtomicI64>,
    bucket: Arc<TokenBucket>,
    running: Mutex<Option<CancellationToken>>,
}

impl RampUpRateLimiter {
    /// Create a limiter from a ramp-up rate such as `"10/200ms"`
    ///
    /// A `max_threshold` of 0 leaves the threshold uncapped.
    ///
    /// # Errors
    /// Returns [`crate::SwarmError::InvalidRampUpRate`] for a malformed rate.
    pub fn new(max_threshold: i64, ramp_up_rate: &str, refill_period: Duration) -> SwarmResult<Self> {
        let (ramp_up_step, ramp_up_period) = parse_ramp_up_rate(ramp_up_rate)?;
        Ok(Self {
            max_threshold,
            ramp_up_step,
            ramp_up_period,
            refill_period,
            next_threshold: Arc::new(AtomicI64::new(0)),
            bucket: Arc::new(TokenBucket::new()),
            running: Mutex::new(None),
        })
    }

    /// Tokens added to the threshold every ramp-up period
    pub fn ramp_up_step(&self) -> i64 {
        self.ramp_up_step
    }

    /// Interval between ramp-up steps
    pub fn ramp_up_period(&self) -> Duration {
        self.ramp_up_period
    }

    /// Threshold that will apply from the next refill
    pub fn next_threshold(&self) -> i64 {
        self.next_threshold.load(Ordering::Acquire)
    }

    /// Tokens left in the current period (negative while callers are parked)
    pub fn available(&self) -> i64 {
        self.bucket.available()
    }

    fn ramp(next: &AtomicI64, step: i64, max: i64) -> i64 {
        let mut value = next.load(Ordering::Acquire).saturating_add(step);
        if max > 0 && value > max {
            value = max;
        }
        next.store(value, Ordering::Release);
        value
    }
}

#[async_trait]
impl RateLimiter for RampUpRateLimiter {
    fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *running = Some(cancel.clone());
        drop(running);

        let next = Arc::clone(&self.next_threshold);
        let bucket = Arc::clone(&self.bucket);
        let (step, max) = (self.ramp_up_step, self.max_threshold);

        // The first step applies immediately.
        bucket.fill(Self::ramp(&next, step, max));

        let now = Instant::now();
        let mut ramp_tick = interval_at(now + self.ramp_up_period, self.ramp_up_period);
        let mut refill_tick = interval_at(now + self.refill_period, self.refill_period);
        ramp_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        refill_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                // Ramp before refill when both are due.
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ramp_tick.tick() => {
                        let value = Self::ramp(&next, step, max);
                        tracing::trace!(next_threshold = value, "Ramp-up step");
                    }
                    _ = refill_tick.tick() => {
                        bucket.fill(next.load(Ordering::Acquire));
                        bucket.wake_all();
                    }
                }
            }
            tracing::debug!("Ramp-up rate limiter stopped");
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

impl Drop for RampUpRateLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}
