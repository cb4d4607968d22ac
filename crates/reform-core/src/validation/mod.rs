#![forbid(unsafe_code)]

//! Validation primitives for control trees.
//!
//! This module provides:
//! - A [`Validator`] trait for synchronous checks that see the value under
//!   validation plus read access to the rest of the tree
//! - Built-in validators (required, min/max length, regex pattern, email,
//!   banned words, opaque predicates, cross-field equality)
//! - An [`AsyncValidator`] trait whose verdict arrives later through an
//!   [`AsyncReply`]
//! - A per-binding [`AsyncValidationCoordinator`] with monotonic tokens,
//!   staleness rejection, input deduplication, and a bounded event trace
//!
//! # Example
//!
//! ```rust
//! use reform_core::path::FormPath;
//! use reform_core::validation::{MinLength, Required, ValidationContext, Validator};
//! use serde_json::json;
//!
//! let path = FormPath::parse("firstName");
//! let ctx = ValidationContext::detached(&path);
//!
//! assert!(Required::new().validate(&json!("ma9net"), &ctx).is_valid());
//! assert!(MinLength::new(4).validate(&json!("ab"), &ctx).is_invalid());
//! ```

pub mod async_validation;
pub mod checks;
mod validators;

pub use async_validation::{
    ApplyDecision, AsyncOutcome, AsyncReply, AsyncValidationCoordinator, AsyncValidator,
    DEFAULT_TRACE_CAPACITY, InFlightValidation, InfrastructureError, SharedAsyncValidator,
    ValidationEvent, ValidationToken, ValidationTrace,
};
pub use checks::{DeferredCheck, DeferredRequest, Normalization, ThreadedCheck};
pub use validators::{
    BannedWords,
    // Error kinds
    ERROR_KIND_BANNED_WORDS,
    ERROR_KIND_EMAIL,
    ERROR_KIND_FIELDS_MATCH,
    ERROR_KIND_MAX_LENGTH,
    ERROR_KIND_MIN_LENGTH,
    ERROR_KIND_PATTERN,
    ERROR_KIND_REQUIRED,
    // Built-in validators
    Email,
    // Core types
    ErrorMap,
    FieldLookup,
    FieldsMatch,
    MaxLength,
    MinLength,
    Pattern,
    Predicate,
    Required,
    SharedValidator,
    ValidationContext,
    ValidationError,
    ValidationResult,
    Validator,
};
