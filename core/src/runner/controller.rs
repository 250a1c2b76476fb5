//! Spawn ramp control

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Tracks target and current user counts and paces the ramp toward the target
///
/// Created fresh for every run. Counters are atomics so user tasks can
/// check in and out without locking; only the spawn rate sits behind a lock.
#[derive(Debug)]
pub struct Controller {
    spawn_count: AtomicI64,
    spawn_rate: RwLock<f64>,
    current_clients: AtomicI64,
    launched: AtomicI64,
    rebalance: Notify,
    spawn_complete: AtomicBool,
}

impl Controller {
    /// Create a controller targeting `spawn_count` users at `spawn_rate` per second
    pub fn new(spawn_count: i64, spawn_rate: f64) -> Self {
        Self {
            spawn_count: AtomicI64::new(spawn_count),
            spawn_rate: RwLock::new(spawn_rate),
            current_clients: AtomicI64::new(0),
            launched: AtomicI64::new(0),
            rebalance: Notify::new(),
            spawn_complete: AtomicBool::new(false),
        }
    }

    /// Target user count
    pub fn spawn_count(&self) -> i64 {
        self.spawn_count.load(Ordering::Acquire)
    }

    /// Users started per second
    pub fn spawn_rate(&self) -> f64 {
        *self.spawn_rate.read()
    }

    /// Users currently running
    pub fn current_clients(&self) -> i64 {
        self.current_clients.load(Ordering::Acquire)
    }

    /// Claim a slot for one more user if that stays within the target
    pub fn acquire(&self) -> bool {
        let target = self.spawn_count();
        self.current_clients
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < target).then_some(current + 1)
            })
            .is_ok()
    }

    /// Give up a slot if there are more users than the target
    ///
    /// A user that gets `true` must exit without calling [`release`](Self::release).
    pub fn erase(&self) -> bool {
        let target = self.spawn_count();
        self.current_clients
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current > target).then_some(current - 1)
            })
            .is_ok()
    }

    /// Give up a slot unconditionally; returns the remaining user count
    pub fn release(&self) -> i64 {
        self.current_clients.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Slots the ramp has handed out toward the current target
    pub fn launched(&self) -> i64 {
        self.launched.load(Ordering::Acquire)
    }

    /// Claim a slot for the ramp
    ///
    /// Unlike [`acquire`](Self::acquire), a slot released by a user that
    /// exited on its own is not handed out again until the next
    /// [`set_spawn`](Self::set_spawn).
    fn claim(&self) -> bool {
        if self.launched() >= self.spawn_count() || !self.acquire() {
            return false;
        }
        self.launched.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Re-target the ramp; non-positive values leave the field unchanged
    ///
    /// Slots freed since the last target are reopened.
    pub fn set_spawn(&self, spawn_count: i64, spawn_rate: f64) {
        self.launched.store(self.current_clients(), Ordering::Release);
        if spawn_count > 0 {
            self.spawn_count.store(spawn_count, Ordering::Release);
        }
        if spawn_rate > 0.0 {
            *self.spawn_rate.write() = spawn_rate;
        }
        self.spawn_complete.store(false, Ordering::Release);
        self.rebalance.notify_one();
    }

    /// Whether the ramp reached its current target
    pub fn is_spawn_complete(&self) -> bool {
        self.spawn_complete.load(Ordering::Acquire)
    }

    fn spawn_interval(&self) -> Duration {
        let rate = self.spawn_rate();
        if rate <= 0.0 || rate.is_nan() {
            return Duration::ZERO;
        }
        Duration::from_micros((1_000_000.0 / rate) as u64)
    }

    /// Ramp toward the target until `stopping` is cancelled
    ///
    /// Each claimed slot is paced by the spawn interval and then handed to
    /// `launch`. Once the target is reached `on_complete` runs (once per
    /// target) and the loop parks until [`set_spawn`](Self::set_spawn) wakes
    /// it.
    pub async fn spawn_workers<L, C>(&self, stopping: CancellationToken, mut launch: L, on_complete: C)
    where
        L: FnMut(),
        C: Fn(),
    {
        loop {
            if stopping.is_cancelled() {
                return;
            }
            if self.claim() {
                tokio::select! {
                    _ = stopping.cancelled() => {
                        self.release();
                        return;
                    }
                    _ = tokio::time::sleep(self.spawn_interval()) => {}
                }
                launch();
            } else {
                if !self.spawn_complete.swap(true, Ordering::AcqRel) {
                    on_complete();
                }
                tokio::select! {
                    _ = stopping.cancelled() => return,
                    _ = self.rebalance.notified() => {}
                }
            }
        }
    }
}
