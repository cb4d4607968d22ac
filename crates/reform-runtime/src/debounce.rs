#![forbid(unsafe_code)]

//! Latest-wins debounce timer.
//!
//! Each async binding owns one [`DebounceTimer`]. Arming it while already
//! armed replaces the held value and restarts the quiet window, so only the
//! last value of a burst is ever released.
//!
//! # Invariants
//!
//! - **Latest-wins**: `poll` only ever yields the most recently armed value.
//! - **Quiescence**: nothing is released until `window` has elapsed since
//!   the last `arm`.
//! - **One-shot**: a released value is not released again.

use std::time::Duration;

use serde_json::Value;

/// A restartable quiet-window timer holding the value to release.
#[derive(Debug, Clone)]
pub struct DebounceTimer {
    window: Duration,
    armed: Option<Armed>,
}

#[derive(Debug, Clone)]
struct Armed {
    value: Value,
    deadline: Duration,
}

impl DebounceTimer {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            armed: None,
        }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Hold `value` and (re)start the window at `now`.
    pub fn arm(&mut self, value: Value, now: Duration) {
        self.armed = Some(Armed {
            value,
            deadline: now.saturating_add(self.window),
        });
    }

    /// Drop the held value without releasing it.
    pub fn disarm(&mut self) -> bool {
        self.armed.take().is_some()
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// When the held value will be released.
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.armed.as_ref().map(|a| a.deadline)
    }

    /// Time left until release, zero if already due.
    #[must_use]
    pub fn time_until_fire(&self, now: Duration) -> Option<Duration> {
        self.deadline().map(|d| d.saturating_sub(now))
    }

    /// Release the held value if the window has closed.
    pub fn poll(&mut self, now: Duration) -> Option<Value> {
        match &self.armed {
            Some(armed) if now >= armed.deadline => self.armed.take().map(|a| a.value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn releases_after_quiet_window() {
        let mut timer = DebounceTimer::new(ms(300));
        timer.arm(json!("a"), ms(0));
        assert_eq!(timer.poll(ms(299)), None);
        assert_eq!(timer.poll(ms(300)), Some(json!("a")));
        assert_eq!(timer.poll(ms(1000)), None);
    }

    #[test]
    fn rearming_restarts_window_latest_wins() {
        let mut timer = DebounceTimer::new(ms(300));
        timer.arm(json!("m"), ms(0));
        timer.arm(json!("ma"), ms(50));
        timer.arm(json!("ma9"), ms(80));
        assert_eq!(timer.poll(ms(300)), None);
        assert_eq!(timer.time_until_fire(ms(300)), Some(ms(80)));
        assert_eq!(timer.poll(ms(380)), Some(json!("ma9")));
    }

    #[test]
    fn zero_window_fires_immediately() {
        let mut timer = DebounceTimer::new(Duration::ZERO);
        timer.arm(json!(1), ms(10));
        assert_eq!(timer.poll(ms(10)), Some(json!(1)));
    }

    #[test]
    fn disarm_drops_value() {
        let mut timer = DebounceTimer::new(ms(100));
        timer.arm(json!(1), ms(0));
        assert!(timer.disarm());
        assert!(!timer.is_armed());
        assert_eq!(timer.poll(ms(500)), None);
        assert!(!timer.disarm());
    }
}
