#![forbid(unsafe_code)]

//! Engine configuration.

use std::time::Duration;

use reform_core::validation::DEFAULT_TRACE_CAPACITY;

/// Configuration for a [`FormEngine`](crate::FormEngine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Debounce window for async validators whose schema does not name one.
    pub default_debounce: Duration,

    /// Record per-binding async traces.
    pub trace_async: bool,

    /// Events kept per binding trace when tracing is on.
    pub max_trace_events: usize,

    /// Re-capture the `initial` checkpoint after every dynamic-field
    /// delivery, so a reset returns to the fully loaded form.
    pub recapture_initial_on_delivery: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_debounce: Duration::from_millis(300),
            trace_async: true,
            max_trace_events: DEFAULT_TRACE_CAPACITY,
            recapture_initial_on_delivery: true,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_default_debounce(mut self, window: Duration) -> Self {
        self.default_debounce = window;
        self
    }

    #[must_use]
    pub fn with_async_trace(mut self, enabled: bool) -> Self {
        self.trace_async = enabled;
        self
    }

    #[must_use]
    pub fn with_max_trace_events(mut self, max: usize) -> Self {
        self.max_trace_events = max;
        self
    }

    #[must_use]
    pub fn with_initial_recapture(mut self, enabled: bool) -> Self {
        self.recapture_initial_on_delivery = enabled;
        self
    }

    /// Trace capacity actually used by bindings.
    pub(crate) fn trace_capacity(&self) -> usize {
        if self.trace_async {
            self.max_trace_events
        } else {
            0
        }
    }
}
