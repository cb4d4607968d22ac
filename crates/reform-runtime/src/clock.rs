#![forbid(unsafe_code)]

//! Time sources for debounce deadlines and trace timestamps.
//!
//! The engine only ever asks "how long since you started?", so a clock is a
//! monotonic [`Duration`] source. [`SystemClock`] reads the wall clock
//! (through `web_time`, so wasm targets work); [`ManualClock`] is advanced
//! explicitly and makes debounce behaviour deterministic in tests.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use web_time::Instant;

/// A monotonic elapsed-time source.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's epoch.
    fn elapsed(&self) -> Duration;
}

/// Wall-clock time since construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(as_nanos(by), Ordering::SeqCst);
    }

    /// Jump to an absolute elapsed time. Callers must not move backwards.
    pub fn set(&self, at: Duration) {
        self.nanos.store(as_nanos(at), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

fn as_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_and_shares_time() {
        let clock = ManualClock::new();
        let other = clock.clone();
        assert_eq!(clock.elapsed(), Duration::ZERO);
        clock.advance(Duration::from_millis(50));
        other.advance(Duration::from_millis(30));
        assert_eq!(clock.elapsed(), Duration::from_millis(80));
        clock.set(Duration::from_millis(300));
        assert_eq!(other.elapsed(), Duration::from_millis(300));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.elapsed();
        let b = clock.elapsed();
        assert!(b >= a);
    }
}
