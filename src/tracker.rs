//! In-flight request tracker (C2).
//!
//! Counts outstanding commands per device so teardown can wait for the
//! device to go idle, and so primitives know when to invoke
//! `processing_complete` for batched reaping.

use std::sync::atomic::{AtomicI64, Ordering};

/// `{in_flight_count, lock}` from `spec.md` §3/§4.2. The spec calls for a
/// spinlock-protected integer; a single atomic with Acquire/Release ordering
/// gives the same "one integer update" critical section without a separate
/// lock object.
#[derive(Debug, Default)]
pub struct AioTracker {
    in_flight: AtomicI64,
}

impl AioTracker {
    pub fn new() -> Self {
        Self { in_flight: AtomicI64::new(0) }
    }

    /// Must be called before a command enters any path that can defer
    /// completion (spec.md §4.2).
    pub fn track_start(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Must be called exactly once per `track_start`, from inside the
    /// completion hook, before `complete(cmd)` reaches the transport.
    /// Returns whether the tracker is now idle.
    pub fn track_finish(&self) -> bool {
        let prev = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "AioTracker underflow: track_finish without matching track_start");
        prev - 1 == 0
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_after_balanced_start_finish() {
        let t = AioTracker::new();
        t.track_start();
        t.track_start();
        assert!(!t.track_finish());
        assert!(t.track_finish());
        assert!(t.is_idle());
    }

    #[test]
    fn never_goes_negative_in_balanced_use() {
        let t = AioTracker::new();
        t.track_start();
        assert!(t.track_finish());
        assert_eq!(t.in_flight(), 0);
    }
}
