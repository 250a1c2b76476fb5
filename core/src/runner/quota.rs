//! Global loop quota

use std::sync::atomic::{AtomicI64, Ordering};

/// Caps the total number of task invocations across every user of a run
#[derive(Debug)]
pub struct LoopQuota {
    loop_count: i64,
    acquired: AtomicI64,
    finished: AtomicI64,
}

impl LoopQuota {
    /// Create a quota of `loop_count` invocations
    pub fn new(loop_count: i64) -> Self {
        Self {
            loop_count,
            acquired: AtomicI64::new(0),
            finished: AtomicI64::new(0),
        }
    }

    /// Total invocations allowed
    pub fn loop_count(&self) -> i64 {
        self.loop_count
    }

    /// Claim one invocation; `false` once all are claimed
    pub fn acquire(&self) -> bool {
        let loop_count = self.loop_count;
        self.acquired
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |acquired| {
                (acquired < loop_count).then_some(acquired + 1)
            })
            .is_ok()
    }

    /// Mark one claimed invocation as done
    pub fn finish(&self) {
        self.finished.fetch_add(1, Ordering::AcqRel);
    }

    /// Invocations completed so far
    pub fn finished(&self) -> i64 {
        self.finished.load(Ordering::Acquire)
    }

    /// Whether every invocation has completed
    pub fn is_finished(&self) -> bool {
        self.finished() == self.loop_count
    }

    /// Private per-user quota for `spawn_count` users
    ///
    /// Integer division, so totals are exact only when `loop_count` is a
    /// multiple of `spawn_count`. Never below 1.
    pub fn per_user(&self, spawn_count: i64) -> i64 {
        if spawn_count <= 0 {
            return self.loop_count.max(1);
        }
        (self.loop_count / spawn_count).max(1)
    }
}
