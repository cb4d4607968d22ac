#![forbid(unsafe_code)]

//! Async validation with token-based staleness prevention.
//!
//! Each async validator bound to a node gets its own
//! [`AsyncValidationCoordinator`]. The coordinator:
//! - Issues strictly increasing [`ValidationToken`]s, one per evaluation
//! - Cancels the in-flight evaluation when a newer input arrives
//! - Applies a completion only if its token is the live one
//! - Remembers the last applied input so identical inputs are not re-checked
//! - Records every lifecycle step in a bounded [`ValidationTrace`]
//!
//! # Design Principles
//!
//! 1. **Monotonic Tokens**: tokens never repeat within a coordinator, so a
//!    completion can always be matched to exactly one issuance.
//! 2. **Staleness Prevention**: a completion for a cancelled or superseded
//!    token is dropped and recorded as [`ValidationEvent::StaleDiscarded`].
//! 3. **Deterministic Time**: callers pass the current time explicitly, so
//!    traces replay identically under a manual clock.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use reform_core::validation::{
//!     ApplyDecision, AsyncValidationCoordinator, ValidationResult,
//! };
//! use serde_json::json;
//!
//! let mut coordinator = AsyncValidationCoordinator::new();
//! let first = coordinator.start_validation(json!("ma9net"), Duration::ZERO);
//! let second = coordinator.start_validation(json!("hadi"), Duration::from_millis(100));
//!
//! let late = coordinator.try_apply_result(first, &Ok(ValidationResult::Valid), Duration::from_millis(500));
//! assert!(matches!(late, ApplyDecision::StaleDiscarded { .. }));
//!
//! let fresh = coordinator.try_apply_result(second, &Ok(ValidationResult::Valid), Duration::from_millis(150));
//! assert_eq!(fresh, ApplyDecision::Applied);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::ValidationResult;

/// Default number of events kept per trace.
pub const DEFAULT_TRACE_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// ValidationToken
// ---------------------------------------------------------------------------

/// Sequence number of one async evaluation.
///
/// # Invariants
///
/// - Tokens are strictly monotonic per coordinator: `token_n < token_{n+1}`
/// - Token 0 is reserved for "no validation"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValidationToken(u64);

impl ValidationToken {
    /// The null token representing no validation.
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl Default for ValidationToken {
    fn default() -> Self {
        Self::NONE
    }
}

impl std::fmt::Display for ValidationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// The async check mechanism itself failed (transport error, timeout imposed
/// by the validator, crashed worker). Distinct from "the value is invalid".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct InfrastructureError {
    pub message: String,
}

impl InfrastructureError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// What an async evaluation resolves to.
pub type AsyncOutcome = Result<ValidationResult, InfrastructureError>;

// ---------------------------------------------------------------------------
// ValidationEvent
// ---------------------------------------------------------------------------

/// An event in the validation lifecycle, recorded for tracing and tests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValidationEvent {
    /// Evaluation issued.
    Started { token: ValidationToken, elapsed_ns: u64 },

    /// In-flight evaluation cancelled; its completion will be discarded.
    /// `superseded_by` is [`ValidationToken::NONE`] when cancelled by a value
    /// change that has not issued its own evaluation yet.
    Cancelled {
        token: ValidationToken,
        superseded_by: ValidationToken,
        elapsed_ns: u64,
    },

    /// Evaluation resolved (may or may not be applied).
    Completed {
        token: ValidationToken,
        is_valid: bool,
        duration_ns: u64,
        elapsed_ns: u64,
    },

    /// Result applied to the node.
    Applied {
        token: ValidationToken,
        is_valid: bool,
        elapsed_ns: u64,
    },

    /// The check mechanism failed for the live token.
    Failed { token: ValidationToken, elapsed_ns: u64 },

    /// Input equal to the last applied one; previous result reused.
    Reused { token: ValidationToken, elapsed_ns: u64 },

    /// Result discarded as stale.
    StaleDiscarded {
        token: ValidationToken,
        current_token: ValidationToken,
        elapsed_ns: u64,
    },
}

impl ValidationEvent {
    #[must_use]
    pub fn token(&self) -> ValidationToken {
        match self {
            Self::Started { token, .. }
            | Self::Cancelled { token, .. }
            | Self::Completed { token, .. }
            | Self::Applied { token, .. }
            | Self::Failed { token, .. }
            | Self::Reused { token, .. }
            | Self::StaleDiscarded { token, .. } => *token,
        }
    }

    /// Event type name for logging.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Cancelled { .. } => "cancelled",
            Self::Completed { .. } => "completed",
            Self::Applied { .. } => "applied",
            Self::Failed { .. } => "failed",
            Self::Reused { .. } => "reused",
            Self::StaleDiscarded { .. } => "stale_discarded",
        }
    }
}

// ---------------------------------------------------------------------------
// ValidationTrace
// ---------------------------------------------------------------------------

/// A bounded trace of validation events. Oldest events drop first.
#[derive(Debug, Clone)]
pub struct ValidationTrace {
    events: VecDeque<ValidationEvent>,
    capacity: usize,
    dropped: u64,
}

impl Default for ValidationTrace {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TRACE_CAPACITY)
    }
}

impl ValidationTrace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A trace keeping at most `capacity` events. Zero disables recording.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, event: ValidationEvent) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.dropped += 1;
        }
        self.events.push_back(event);
    }

    pub fn events(&self) -> impl Iterator<Item = &ValidationEvent> {
        self.events.iter()
    }

    /// Number of events evicted or skipped because of the capacity bound.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    #[must_use]
    pub fn contains_event_type(&self, token: ValidationToken, event_type: &str) -> bool {
        self.events
            .iter()
            .any(|e| e.token() == token && e.event_type() == event_type)
    }

    #[must_use]
    pub fn events_for_token(&self, token: ValidationToken) -> Vec<&ValidationEvent> {
        self.events.iter().filter(|e| e.token() == token).collect()
    }

    /// Number of events of one type.
    #[must_use]
    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Verify trace invariants. Returns a list of violations.
    #[must_use]
    pub fn verify_invariants(&self) -> Vec<String> {
        let mut violations = Vec::new();

        // Started tokens are strictly monotonic.
        let mut last_started = ValidationToken::NONE;
        for event in &self.events {
            if let ValidationEvent::Started { token, .. } = event {
                if *token <= last_started {
                    violations.push(format!(
                        "Non-monotonic start token: {token} after {last_started}"
                    ));
                }
                last_started = *token;
            }
        }

        // A discarded token was superseded, cancelled, or already settled.
        for (i, event) in self.events.iter().enumerate() {
            if let ValidationEvent::StaleDiscarded {
                token,
                current_token,
                ..
            } = event
            {
                let retired_before = self.events.iter().take(i).any(|e| match e {
                    ValidationEvent::Cancelled { token: t, .. }
                    | ValidationEvent::Applied { token: t, .. }
                    | ValidationEvent::Failed { token: t, .. } => t == token,
                    _ => false,
                });
                if token >= current_token && !retired_before {
                    violations.push(format!(
                        "StaleDiscarded for live token: {token} (current {current_token})"
                    ));
                }
            }
        }

        // Applied at most once per token.
        for event in &self.events {
            if let ValidationEvent::Applied { token, .. } = event {
                let applied = self
                    .events
                    .iter()
                    .filter(|e| matches!(e, ValidationEvent::Applied { token: t, .. } if t == token))
                    .count();
                if applied > 1 {
                    violations.push(format!("{token} applied {applied} times"));
                }
            }
        }

        violations
    }
}

// ---------------------------------------------------------------------------
// AsyncValidationCoordinator
// ---------------------------------------------------------------------------

/// The evaluation currently awaiting its completion.
#[derive(Debug, Clone)]
pub struct InFlightValidation {
    pub token: ValidationToken,
    pub started_at: Duration,
}

/// What happened to a completion handed to
/// [`AsyncValidationCoordinator::try_apply_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyDecision {
    /// The result is now the binding's result.
    Applied,
    /// The check mechanism failed for the live token.
    Failed,
    /// Superseded or cancelled; nothing changed.
    StaleDiscarded { current: ValidationToken },
}

/// Per-(node, validator) sequencing of async evaluations.
///
/// Single-threaded by design: the owner starts evaluations and applies
/// completions on one logical timeline, while the evaluations themselves run
/// elsewhere.
#[derive(Debug, Clone)]
pub struct AsyncValidationCoordinator {
    next_token: u64,
    current_token: ValidationToken,
    in_flight: Option<InFlightValidation>,
    in_flight_input: Option<Value>,
    last_applied: Option<(Value, ValidationToken)>,
    current_result: Option<ValidationResult>,
    trace: ValidationTrace,
}

impl Default for AsyncValidationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncValidationCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::with_trace(ValidationTrace::new())
    }

    /// A coordinator recording into the given (possibly zero-capacity) trace.
    #[must_use]
    pub fn with_trace(trace: ValidationTrace) -> Self {
        Self {
            next_token: 1,
            current_token: ValidationToken::NONE,
            in_flight: None,
            in_flight_input: None,
            last_applied: None,
            current_result: None,
            trace,
        }
    }

    /// Issue a new evaluation for `input` (already normalized), cancelling
    /// any in-flight one.
    pub fn start_validation(&mut self, input: Value, now: Duration) -> ValidationToken {
        let token = ValidationToken(self.next_token);
        self.next_token += 1;
        let elapsed_ns = nanos(now);

        if let Some(previous) = self.in_flight.take() {
            self.trace.push(ValidationEvent::Cancelled {
                token: previous.token,
                superseded_by: token,
                elapsed_ns,
            });
        }

        self.in_flight = Some(InFlightValidation {
            token,
            started_at: now,
        });
        self.in_flight_input = Some(input);
        self.current_token = token;
        self.trace.push(ValidationEvent::Started { token, elapsed_ns });
        token
    }

    /// Cancel the in-flight evaluation, if any. Its completion will be
    /// discarded.
    pub fn cancel(&mut self, now: Duration) -> Option<ValidationToken> {
        let previous = self.in_flight.take()?;
        self.in_flight_input = None;
        self.trace.push(ValidationEvent::Cancelled {
            token: previous.token,
            superseded_by: ValidationToken::NONE,
            elapsed_ns: nanos(now),
        });
        Some(previous.token)
    }

    /// Whether `input` equals the input of the last applied result.
    #[must_use]
    pub fn is_duplicate(&self, input: &Value) -> bool {
        self.last_applied
            .as_ref()
            .is_some_and(|(applied, _)| applied == input)
    }

    /// Record that a duplicate input reused the previous result.
    pub fn record_reuse(&mut self, now: Duration) {
        let token = self
            .last_applied
            .as_ref()
            .map_or(ValidationToken::NONE, |(_, token)| *token);
        self.trace.push(ValidationEvent::Reused {
            token,
            elapsed_ns: nanos(now),
        });
    }

    /// Try to apply a completion.
    pub fn try_apply_result(
        &mut self,
        token: ValidationToken,
        outcome: &AsyncOutcome,
        now: Duration,
    ) -> ApplyDecision {
        let elapsed_ns = nanos(now);
        let live = self.in_flight.as_ref().filter(|f| f.token == token).cloned();
        let duration_ns = live
            .as_ref()
            .map_or(0, |f| nanos(now.saturating_sub(f.started_at)));

        self.trace.push(ValidationEvent::Completed {
            token,
            is_valid: matches!(outcome, Ok(r) if r.is_valid()),
            duration_ns,
            elapsed_ns,
        });

        if live.is_none() {
            self.trace.push(ValidationEvent::StaleDiscarded {
                token,
                current_token: self.current_token,
                elapsed_ns,
            });
            return ApplyDecision::StaleDiscarded {
                current: self.current_token,
            };
        }

        self.in_flight = None;
        let input = self.in_flight_input.take();
        match outcome {
            Ok(result) => {
                if let Some(input) = input {
                    self.last_applied = Some((input, token));
                }
                self.current_result = Some(result.clone());
                self.trace.push(ValidationEvent::Applied {
                    token,
                    is_valid: result.is_valid(),
                    elapsed_ns,
                });
                ApplyDecision::Applied
            }
            Err(_) => {
                self.trace.push(ValidationEvent::Failed { token, elapsed_ns });
                ApplyDecision::Failed
            }
        }
    }

    /// Forget the cached result so the next input is always evaluated.
    pub fn invalidate_cache(&mut self) {
        self.last_applied = None;
        self.current_result = None;
    }

    #[must_use]
    pub fn current_token(&self) -> ValidationToken {
        self.current_token
    }

    #[must_use]
    pub fn current_result(&self) -> Option<&ValidationResult> {
        self.current_result.as_ref()
    }

    #[must_use]
    pub fn in_flight(&self) -> Option<&InFlightValidation> {
        self.in_flight.as_ref()
    }

    #[must_use]
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    #[must_use]
    pub fn trace(&self) -> &ValidationTrace {
        &self.trace
    }

    /// Verify that the trace satisfies all invariants.
    pub fn verify_trace(&self) -> Result<(), Vec<String>> {
        let violations = self.trace.verify_invariants();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// AsyncValidator Trait
// ---------------------------------------------------------------------------

type Deliver = dyn FnOnce(ValidationToken, AsyncOutcome) + Send;

/// One-shot handle an async validator resolves when its check finishes.
///
/// It may be resolved from any thread, at any later time. Dropping it
/// unresolved leaves the evaluation outstanding until superseded.
pub struct AsyncReply {
    token: ValidationToken,
    deliver: Box<Deliver>,
}

impl AsyncReply {
    #[must_use]
    pub fn new(
        token: ValidationToken,
        deliver: impl FnOnce(ValidationToken, AsyncOutcome) + Send + 'static,
    ) -> Self {
        Self {
            token,
            deliver: Box::new(deliver),
        }
    }

    /// The evaluation this reply belongs to.
    #[must_use]
    pub fn token(&self) -> ValidationToken {
        self.token
    }

    pub fn resolve(self, outcome: AsyncOutcome) {
        (self.deliver)(self.token, outcome);
    }
}

impl std::fmt::Debug for AsyncReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncReply")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// A validator whose verdict arrives later (network calls, slow lookups).
///
/// `validate` must not block: hand the work to a thread or executor and
/// resolve the reply from there.
pub trait AsyncValidator: Send + Sync {
    /// Identity and error kind. Results are stored under this key.
    fn name(&self) -> &str;

    /// Normalization used to decide whether two inputs are the same check.
    fn normalize(&self, value: &Value) -> Value {
        value.clone()
    }

    fn validate(&self, value: Value, reply: AsyncReply);
}

/// Shared handle to an async validator.
pub type SharedAsyncValidator = Arc<dyn AsyncValidator>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
