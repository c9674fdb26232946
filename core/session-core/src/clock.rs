//! Wall-clock sources with an adjustable server-time offset.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Millisecond wall clock. `now()` always includes the current offset.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;

    fn offset(&self) -> i64;

    fn set_offset(&self, offset_ms: i64);

    fn reset_offset(&self) {
        self.set_offset(0);
    }
}

#[derive(Debug, Default)]
pub struct SystemClock {
    offset: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now()
            .timestamp_millis()
            .saturating_add(self.offset.load(Ordering::Relaxed))
    }

    fn offset(&self) -> i64 {
        self.offset.load(Ordering::Relaxed)
    }

    fn set_offset(&self, offset_ms: i64) {
        self.offset.store(offset_ms, Ordering::Relaxed);
    }
}

/// Deterministic clock driven by the caller. Used by the simulator and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
    offset: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        ManualClock {
            now: AtomicI64::new(start_ms),
            offset: AtomicI64::new(0),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::Relaxed);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now
            .load(Ordering::Relaxed)
            .saturating_add(self.offset.load(Ordering::Relaxed))
    }

    fn offset(&self) -> i64 {
        self.offset.load(Ordering::Relaxed)
    }

    fn set_offset(&self, offset_ms: i64) {
        self.offset.store(offset_ms, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now(), 150);
        clock.set(10);
        assert_eq!(clock.now(), 10);
    }

    #[test]
    fn offset_applies_and_resets() {
        let clock = ManualClock::new(1_000);
        clock.set_offset(-250);
        assert_eq!(clock.now(), 750);
        assert_eq!(clock.offset(), -250);
        clock.reset_offset();
        assert_eq!(clock.now(), 1_000);
    }

    #[test]
    fn system_clock_tracks_offset() {
        let clock = SystemClock::new();
        let before = clock.now();
        clock.set_offset(60_000);
        assert!(clock.now() >= before + 60_000);
    }
}
