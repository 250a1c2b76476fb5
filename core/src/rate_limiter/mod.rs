//! Admission control for task execution
//!
//! A rate limiter hands out tokens that are refilled on a fixed period. A
//! user takes one token per task iteration; when the bucket is empty the
//! user is parked until the next refill and every parked user wakes at once.
//!
//! Two policies are provided:
//! - [`StableRateLimiter`]: a fixed number of tokens per refill period
//! - [`RampUpRateLimiter`]: the number of tokens per refill grows by a step
//!   every ramp-up period until it reaches a cap
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use swarm_core::rate_limiter::{RateLimiter, StableRateLimiter};
//!
//! let limiter = StableRateLimiter::new(100, Duration::from_secs(1));
//! limiter.start();
//! let blocked = limiter.acquire().await;
//! ```

mod ramp_up;
mod stable;

pub use ramp_up::RampUpRateLimiter;
pub use stable::StableRateLimiter;

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{SwarmError, SwarmResult};

/// Pluggable admission-control policy
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Begin refilling; calling it on a started limiter does nothing
    fn start(&self);

    /// Take a token
    ///
    /// Returns `false` when a token was available immediately. Returns `true`
    /// after parking the caller until the next refill; the caller should
    /// then try again.
    async fn acquire(&self) -> bool;

    /// Stop refilling; parked callers are not released
    fn stop(&self);
}

/// Signed token counter with a broadcast refill signal
#[derive(Debug)]
pub(crate) struct TokenBucket {
    tokens: AtomicI64,
    refill: watch::Sender<u64>,
}

impl TokenBucket {
    pub(crate) fn new() -> Self {
        let (refill, _) = watch::channel(0);
        Self {
            tokens: AtomicI64::new(0),
            refill,
        }
    }

    /// Reset the number of available tokens
    pub(crate) fn fill(&self, tokens: i64) {
        self.tokens.store(tokens, Ordering::Release);
    }

    /// Wake every parked caller
    pub(crate) fn wake_all(&self) {
        self.refill.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub(crate) fn available(&self) -> i64 {
        self.tokens.load(Ordering::Acquire)
    }

    pub(crate) async fn take(&self) -> bool {
        // Subscribe before decrementing so a refill between the two is not missed.
        let mut refilled = self.refill.subscribe();
        if self.tokens.fetch_sub(1, Ordering::AcqRel) > 0 {
            return false;
        }
        let _ = refilled.changed().await;
        true
    }
}

/// Parse a ramp-up rate of the form `"N"` or `"N/<duration>"`
///
/// `"N"` means N tokens more every second. The duration is one or more
/// `<number><unit>` segments, where the number may carry a fraction and the
/// unit is one of `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`, e.g.
/// `"10/200ms"`, `"3/1.5s"` or `"1/1m30s"`.
///
/// # Errors
/// Returns [`SwarmError::InvalidRampUpRate`] when the step is not a positive
/// integer or the duration is malformed or zero.
pub fn parse_ramp_up_rate(rate: &str) -> SwarmResult<(i64, Duration)> {
    let invalid = || SwarmError::InvalidRampUpRate(rate.to_string());
    let trimmed = rate.trim();

    let (step, period) = match trimmed.split_once('/') {
        Some((step, period)) => (step, parse_period(period.trim()).ok_or_else(invalid)?),
        None => (trimmed, Duration::from_secs(1)),
    };
    let step: i64 = step.trim().parse().map_err(|_| invalid())?;
    if step <= 0 {
        return Err(invalid());
    }
    Ok((step, period))
}

fn parse_period(period: &str) -> Option<Duration> {
    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    if period.is_empty() {
        return None;
    }

    let mut rest = period;
    let mut nanos: u128 = 0;
    while !rest.is_empty() {
        let (number, tail) = rest.split_at(rest.find(|c: char| !is_number(c))?);
        let (unit, tail) = tail.split_at(tail.find(is_number).unwrap_or(tail.len()));
        nanos = nanos.checked_add(segment_nanos(number, unit_nanos(unit)?)?)?;
        rest = tail;
    }

    let nanos = u64::try_from(nanos).ok()?;
    (nanos > 0).then(|| Duration::from_nanos(nanos))
}

fn unit_nanos(unit: &str) -> Option<u128> {
    Some(match unit {
        "ns" => 1,
        "us" | "µs" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60_000_000_000,
        "h" => 3_600_000_000_000,
        _ => return None,
    })
}

/// `number` in units of `unit` nanoseconds; fraction digits below one
/// nanosecond are dropped
fn segment_nanos(number: &str, unit: u128) -> Option<u128> {
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if (whole.is_empty() && fraction.is_empty()) || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut total = whole.checked_mul(unit)?;
    let mut scale = unit;
    for digit in fraction.bytes() {
        scale /= 10;
        total += u128::from(digit - b'0') * scale;
    }
    Some(total)
}
