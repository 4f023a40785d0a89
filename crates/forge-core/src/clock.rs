//! The coordinator-wide logical clock.
//!
//! A single monotonic counter, incremented on every authoritative mutation
//! and advanced past any clock value a client reports. Gives sync-log
//! entries a total order; plays no part in conflict arbitration.

use std::sync::atomic::{AtomicI64, Ordering};

/// Monotonic logical clock shared by all request handlers.
///
/// Updates go through compare-and-swap loops, so concurrent handlers never
/// lose increments.
#[derive(Debug)]
pub struct LogicalClock {
    value: AtomicI64,
}

impl LogicalClock {
    /// Create a clock starting at `initial` (the max recorded sync-log
    /// clock, or 0 for a fresh deployment).
    pub fn new(initial: i64) -> Self {
        Self {
            value: AtomicI64::new(initial),
        }
    }

    /// The current clock value, without advancing it.
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Advance the clock by one and return the new value.
    pub fn tick(&self) -> i64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Fold in a clock value received from a client: advance to
    /// `max(local, received) + 1` and return the new value.
    pub fn observe(&self, received: i64) -> i64 {
        let mut current = self.value.load(Ordering::SeqCst);
        loop {
            let next = current.max(received) + 1;
            match self.value.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn tick_increments() {
        let clock = LogicalClock::new(0);
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.value(), 2);
    }

    #[test]
    fn observe_advances_past_remote() {
        let clock = LogicalClock::new(5);
        assert_eq!(clock.observe(10), 11);
        assert_eq!(clock.value(), 11);
    }

    #[test]
    fn observe_ignores_stale_remote() {
        let clock = LogicalClock::new(20);
        assert_eq!(clock.observe(3), 21);
    }

    #[tokio::test]
    async fn concurrent_ticks_never_lose_increments() {
        let clock = Arc::new(LogicalClock::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let clock = Arc::clone(&clock);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    clock.tick();
                }
            }));
        }
        for handle in handles {
            handle.await.expect("task should finish");
        }
        assert_eq!(clock.value(), 800);
    }
}
