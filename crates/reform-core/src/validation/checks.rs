#![forbid(unsafe_code)]

//! Ready-made [`AsyncValidator`] implementations.
//!
//! - [`ThreadedCheck`] runs a blocking closure on a background thread, the
//!   shape of a "is this username taken?" lookup.
//! - [`DeferredCheck`] parks each request until the host resolves it, for
//!   embedding into an external executor and for deterministic tests.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::trace;

use super::async_validation::{AsyncOutcome, AsyncReply, AsyncValidator, ValidationToken};

/// How inputs are compared when deciding whether a check can be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Normalization {
    /// Values compared as-is.
    #[default]
    Exact,
    /// Strings compared after trimming surrounding whitespace.
    Trimmed,
    /// Strings compared trimmed and lowercased.
    CaseInsensitive,
}

impl Normalization {
    #[must_use]
    pub fn apply(self, value: &Value) -> Value {
        match (self, value) {
            (Self::Trimmed, Value::String(s)) => Value::String(s.trim().to_string()),
            (Self::CaseInsensitive, Value::String(s)) => Value::String(s.trim().to_lowercase()),
            _ => value.clone(),
        }
    }
}

type CheckFn = dyn Fn(&Value) -> AsyncOutcome + Send + Sync;

/// Runs a blocking check on a fresh background thread per evaluation.
///
/// The closure receives the normalized input.
#[derive(Clone)]
pub struct ThreadedCheck {
    name: String,
    normalization: Normalization,
    latency: Duration,
    check: Arc<CheckFn>,
}

impl ThreadedCheck {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&Value) -> AsyncOutcome + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            normalization: Normalization::Exact,
            latency: Duration::ZERO,
            check: Arc::new(check),
        }
    }

    #[must_use]
    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    /// Sleep this long before running the check (simulated network delay).
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl fmt::Debug for ThreadedCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedCheck")
            .field("name", &self.name)
            .field("normalization", &self.normalization)
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

impl AsyncValidator for ThreadedCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn normalize(&self, value: &Value) -> Value {
        self.normalization.apply(value)
    }

    fn validate(&self, value: Value, reply: AsyncReply) {
        let check = Arc::clone(&self.check);
        let latency = self.latency;
        let input = self.normalization.apply(&value);
        trace!(validator = %self.name, token = %reply.token(), "spawning async check");
        thread::spawn(move || {
            if !latency.is_zero() {
                thread::sleep(latency);
            }
            reply.resolve(check(&input));
        });
    }
}

/// A parked evaluation awaiting resolution by the host.
#[derive(Debug)]
pub struct DeferredRequest {
    pub value: Value,
    pub reply: AsyncReply,
}

impl DeferredRequest {
    #[must_use]
    pub fn token(&self) -> ValidationToken {
        self.reply.token()
    }

    pub fn resolve(self, outcome: AsyncOutcome) {
        self.reply.resolve(outcome);
    }
}

/// Parks every evaluation; the host takes the requests and resolves them in
/// whatever order and at whatever time it likes.
///
/// Clones share the same queue.
#[derive(Clone)]
pub struct DeferredCheck {
    name: String,
    normalization: Normalization,
    requests: Arc<Mutex<Vec<DeferredRequest>>>,
}

impl DeferredCheck {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            normalization: Normalization::Exact,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    /// Take every parked request, oldest first.
    #[must_use]
    pub fn take_requests(&self) -> Vec<DeferredRequest> {
        let mut guard = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *guard)
    }

    /// Number of parked requests.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for DeferredCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredCheck")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl AsyncValidator for DeferredCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn normalize(&self, value: &Value) -> Value {
        self.normalization.apply(value)
    }

    fn validate(&self, value: Value, reply: AsyncReply) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DeferredRequest { value, reply });
    }
}
