use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Time source for backoff timers and stall detection. The progress engine
/// only ever compares microsecond deltas, so a monotonic reading is all
/// that is needed - and tests can substitute a hand-cranked clock.
pub trait Clock {
    fn now_micros(&self) -> u64;
}

/// Production clock based on `Instant`.
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock { start: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

/// A clock that only moves when told to. Meant for tests that need to step
/// through backoff expiry deterministically; clones share the same time.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_micros: u64) -> ManualClock {
        ManualClock { now: Arc::new(AtomicU64::new(start_micros)) }
    }

    pub fn advance(&self, micros: u64) {
        self.now.fetch_add(micros, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock() {
        let clock = MonotonicClock::new();
        let a = clock.now_micros();
        let b = clock.now_micros();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_micros(), 100);
        clock.advance(50);
        assert_eq!(clock.now_micros(), 150);
        clock.advance(0);
        assert_eq!(clock.now_micros(), 150);
    }
}
