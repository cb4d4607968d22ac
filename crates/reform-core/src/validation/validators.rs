#![forbid(unsafe_code)]

//! Core validation types and built-in validators.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::path::FormPath;

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Error kind for required field validation.
pub const ERROR_KIND_REQUIRED: &str = "required";
/// Error kind for minimum length validation.
pub const ERROR_KIND_MIN_LENGTH: &str = "minlength";
/// Error kind for maximum length validation.
pub const ERROR_KIND_MAX_LENGTH: &str = "maxlength";
/// Error kind for pattern validation.
pub const ERROR_KIND_PATTERN: &str = "pattern";
/// Error kind for email validation.
pub const ERROR_KIND_EMAIL: &str = "email";
/// Error kind for banned word validation.
pub const ERROR_KIND_BANNED_WORDS: &str = "banWords";
/// Error kind for cross-field equality validation.
pub const ERROR_KIND_FIELDS_MATCH: &str = "fieldsMatch";

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// A validation error with kind, message, and detail parameters.
///
/// The `kind` is the key the error is stored under in a node's [`ErrorMap`].
/// `params` carries structured detail (e.g. `requiredLength`) that a view can
/// read directly or interpolate into `message` with `{key}` placeholders.
///
/// ```rust
/// use reform_core::validation::ValidationError;
///
/// let error = ValidationError::new("minlength", "Must be at least {requiredLength} characters")
///     .with_param("requiredLength", 4);
///
/// assert_eq!(error.format_message(), "Must be at least 4 characters");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Stable error kind for programmatic handling.
    pub kind: String,
    /// Human-readable message template.
    pub message: String,
    /// Structured detail.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
}

impl ValidationError {
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            params: BTreeMap::new(),
        }
    }

    /// Attach a detail parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Look up a detail parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// The message with `{key}` placeholders replaced by parameter values.
    #[must_use]
    pub fn format_message(&self) -> String {
        let mut result = self.message.clone();
        for (key, value) in &self.params {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            result = result.replace(&format!("{{{key}}}"), &rendered);
        }
        result
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_message())
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// ValidationResult
// ---------------------------------------------------------------------------

/// The result of a validation operation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum ValidationResult {
    #[default]
    Valid,
    Invalid(ValidationError),
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    #[must_use]
    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }

    /// Returns the error if the result is `Invalid`.
    #[must_use]
    pub fn error(&self) -> Option<&ValidationError> {
        match self {
            Self::Valid => None,
            Self::Invalid(e) => Some(e),
        }
    }

    /// Consume the result, keeping only the error.
    #[must_use]
    pub fn into_error(self) -> Option<ValidationError> {
        match self {
            Self::Valid => None,
            Self::Invalid(e) => Some(e),
        }
    }
}

impl From<Option<ValidationError>> for ValidationResult {
    fn from(error: Option<ValidationError>) -> Self {
        error.map_or(Self::Valid, Self::Invalid)
    }
}

// ---------------------------------------------------------------------------
// ErrorMap
// ---------------------------------------------------------------------------

/// Errors attached to one node, keyed by error kind.
///
/// Merging is first-wins: once a kind is present, later errors of the same
/// kind are ignored. Validators run in attachment order, so the earliest
/// attached validator owns a shared kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorMap {
    entries: BTreeMap<String, ValidationError>,
}

impl ErrorMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless the kind is already present. Returns whether it was inserted.
    pub fn insert_first_wins(&mut self, error: ValidationError) -> bool {
        if self.entries.contains_key(&error.kind) {
            return false;
        }
        self.entries.insert(error.kind.clone(), error);
        true
    }

    /// Merge every kind from `other` that is not already present.
    pub fn merge_first_wins(&mut self, other: &ErrorMap) {
        for error in other.entries.values() {
            self.insert_first_wins(error.clone());
        }
    }

    pub fn remove(&mut self, kind: &str) -> Option<ValidationError> {
        self.entries.remove(kind)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&ValidationError> {
        self.entries.get(kind)
    }

    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Error kinds in sorted order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.entries.values()
    }
}

impl FromIterator<ValidationError> for ErrorMap {
    fn from_iter<I: IntoIterator<Item = ValidationError>>(iter: I) -> Self {
        let mut map = Self::new();
        for error in iter {
            map.insert_first_wins(error);
        }
        map
    }
}

// ---------------------------------------------------------------------------
// ValidationContext
// ---------------------------------------------------------------------------

/// Read access to the values of a live tree.
pub trait FieldLookup {
    /// The composed value at `path`, or `None` if nothing lives there.
    fn value_at(&self, path: &FormPath) -> Option<Value>;
}

/// What a validator can see besides the value under validation.
#[derive(Clone, Copy)]
pub struct ValidationContext<'a> {
    path: &'a FormPath,
    lookup: Option<&'a dyn FieldLookup>,
}

impl<'a> ValidationContext<'a> {
    /// A context backed by a live tree.
    #[must_use]
    pub fn new(path: &'a FormPath, lookup: &'a dyn FieldLookup) -> Self {
        Self {
            path,
            lookup: Some(lookup),
        }
    }

    /// A context with no tree behind it; sibling lookups return `None`.
    #[must_use]
    pub fn detached(path: &'a FormPath) -> Self {
        Self { path, lookup: None }
    }

    /// Path of the node being validated.
    #[must_use]
    pub fn path(&self) -> &FormPath {
        self.path
    }

    /// Value of a sibling of the node being validated.
    #[must_use]
    pub fn sibling(&self, key: &str) -> Option<Value> {
        let parent = self.path.parent()?;
        self.lookup(&parent.child(key))
    }

    /// Composed value of the parent node.
    #[must_use]
    pub fn parent_value(&self) -> Option<Value> {
        let parent = self.path.parent()?;
        self.lookup(&parent)
    }

    /// Value at an absolute path.
    #[must_use]
    pub fn lookup(&self, path: &FormPath) -> Option<Value> {
        self.lookup.and_then(|lookup| lookup.value_at(path))
    }
}

impl fmt::Debug for ValidationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationContext")
            .field("path", self.path)
            .field("attached", &self.lookup.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Validator Trait
// ---------------------------------------------------------------------------

/// A synchronous validator.
///
/// `name` is the validator's identity: attaching a second validator with the
/// same name to a node is a no-op, and detaching goes by name.
///
/// ```rust
/// use reform_core::path::FormPath;
/// use reform_core::validation::{ValidationContext, ValidationError, ValidationResult, Validator};
/// use serde_json::{Value, json};
///
/// struct NoSpaces;
///
/// impl Validator for NoSpaces {
///     fn name(&self) -> &str {
///         "noSpaces"
///     }
///
///     fn validate(&self, value: &Value, _ctx: &ValidationContext<'_>) -> ValidationResult {
///         match value.as_str() {
///             Some(s) if s.contains(' ') => {
///                 ValidationResult::Invalid(ValidationError::new("noSpaces", "No spaces allowed"))
///             }
///             _ => ValidationResult::Valid,
///         }
///     }
/// }
///
/// let path = FormPath::parse("username");
/// let ctx = ValidationContext::detached(&path);
/// assert!(NoSpaces.validate(&json!("a b"), &ctx).is_invalid());
/// ```
pub trait Validator: Send + Sync {
    /// Identity used for idempotent attach/detach.
    fn name(&self) -> &str;

    /// Validate `value`. Pure: the same inputs give the same result.
    fn validate(&self, value: &Value, ctx: &ValidationContext<'_>) -> ValidationResult;
}

/// Shared handle to a validator, as stored on nodes.
pub type SharedValidator = Arc<dyn Validator>;

/// Angular-style emptiness: null, empty string, or empty array.
fn is_empty_input(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Length of strings (in chars) and arrays; `None` for everything else.
fn value_length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Built-in Validators
// ---------------------------------------------------------------------------

/// Fails on null, empty strings, and empty arrays.
///
/// Whitespace-only strings count as empty unless `allow_whitespace` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct Required {
    pub allow_whitespace: bool,
}

impl Required {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn allow_whitespace(mut self) -> Self {
        self.allow_whitespace = true;
        self
    }
}

impl Validator for Required {
    fn name(&self) -> &str {
        ERROR_KIND_REQUIRED
    }

    fn validate(&self, value: &Value, _ctx: &ValidationContext<'_>) -> ValidationResult {
        let empty = match value {
            Value::String(s) if !self.allow_whitespace => s.trim().is_empty(),
            other => is_empty_input(other),
        };
        if empty {
            ValidationResult::Invalid(ValidationError::new(
                ERROR_KIND_REQUIRED,
                "This field is required",
            ))
        } else {
            ValidationResult::Valid
        }
    }
}

/// Strings or arrays shorter than `min` fail. Empty values pass; pair with
/// [`Required`] to reject them.
#[derive(Debug, Clone)]
pub struct MinLength {
    pub min: usize,
    name: String,
}

impl MinLength {
    #[must_use]
    pub fn new(min: usize) -> Self {
        Self {
            min,
            name: format!("{ERROR_KIND_MIN_LENGTH}:{min}"),
        }
    }
}

impl Validator for MinLength {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, value: &Value, _ctx: &ValidationContext<'_>) -> ValidationResult {
        if is_empty_input(value) {
            return ValidationResult::Valid;
        }
        match value_length(value) {
            Some(len) if len < self.min => ValidationResult::Invalid(
                ValidationError::new(
                    ERROR_KIND_MIN_LENGTH,
                    "Must be at least {requiredLength} characters",
                )
                .with_param("requiredLength", self.min)
                .with_param("actualLength", len),
            ),
            _ => ValidationResult::Valid,
        }
    }
}

/// Strings or arrays longer than `max` fail.
#[derive(Debug, Clone)]
pub struct MaxLength {
    pub max: usize,
    name: String,
}

impl MaxLength {
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            max,
            name: format!("{ERROR_KIND_MAX_LENGTH}:{max}"),
        }
    }
}

impl Validator for MaxLength {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, value: &Value, _ctx: &ValidationContext<'_>) -> ValidationResult {
        match value_length(value) {
            Some(len) if len > self.max => ValidationResult::Invalid(
                ValidationError::new(
                    ERROR_KIND_MAX_LENGTH,
                    "Must be at most {requiredLength} characters",
                )
                .with_param("requiredLength", self.max)
                .with_param("actualLength", len),
            ),
            _ => ValidationResult::Valid,
        }
    }
}

/// Strings must match a regular expression. Empty values pass.
#[derive(Debug, Clone)]
pub struct Pattern {
    regex: Regex,
    name: String,
}

impl Pattern {
    /// Use `regex` as given; anchor it yourself if the whole value must match.
    #[must_use]
    pub fn new(regex: Regex) -> Self {
        let name = format!("{ERROR_KIND_PATTERN}:{}", regex.as_str());
        Self { regex, name }
    }

    /// Compile `pattern` anchored at both ends.
    pub fn full_match(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::new(Regex::new(&format!("^(?:{pattern})$"))?))
    }

    #[must_use]
    pub fn regex(&self) -> &Regex {
        &self.regex
    }
}

impl Validator for Pattern {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, value: &Value, _ctx: &ValidationContext<'_>) -> ValidationResult {
        if is_empty_input(value) {
            return ValidationResult::Valid;
        }
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if self.regex.is_match(&text) {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid(
                ValidationError::new(ERROR_KIND_PATTERN, "Invalid format")
                    .with_param("requiredPattern", self.regex.as_str())
                    .with_param("actualValue", text),
            )
        }
    }
}

/// Heuristic email check: exactly one `@`, text on both sides, a dot in the
/// domain that is neither first nor last. Empty values pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct Email;

impl Email {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Validator for Email {
    fn name(&self) -> &str {
        ERROR_KIND_EMAIL
    }

    fn validate(&self, value: &Value, _ctx: &ValidationContext<'_>) -> ValidationResult {
        if is_empty_input(value) {
            return ValidationResult::Valid;
        }
        let valid = value.as_str().is_some_and(|s| {
            let trimmed = s.trim();
            let mut parts = trimmed.split('@');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(local), Some(domain), None) => {
                    !local.is_empty()
                        && domain.contains('.')
                        && !domain.starts_with('.')
                        && !domain.ends_with('.')
                        && !trimmed.contains(char::is_whitespace)
                }
                _ => false,
            }
        });
        if valid {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid(ValidationError::new(
                ERROR_KIND_EMAIL,
                "Please enter a valid email address",
            ))
        }
    }
}

/// Rejects values from an opaque list, compared trimmed and case-insensitively.
#[derive(Debug, Clone)]
pub struct BannedWords {
    words: Vec<String>,
    name: String,
}

impl BannedWords {
    #[must_use]
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: Vec<String> = words
            .into_iter()
            .map(|w| w.into().trim().to_lowercase())
            .collect();
        let name = format!("{ERROR_KIND_BANNED_WORDS}:{}", words.join(","));
        Self { words, name }
    }
}

impl Validator for BannedWords {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, value: &Value, _ctx: &ValidationContext<'_>) -> ValidationResult {
        let Some(text) = value.as_str() else {
            return ValidationResult::Valid;
        };
        let normalized = text.trim().to_lowercase();
        match self.words.iter().find(|w| **w == normalized) {
            Some(word) => ValidationResult::Invalid(
                ValidationError::new(ERROR_KIND_BANNED_WORDS, "\"{bannedWord}\" is not allowed")
                    .with_param("bannedWord", word.as_str()),
            ),
            None => ValidationResult::Valid,
        }
    }
}

type PredicateFn = dyn Fn(&Value) -> bool + Send + Sync;

/// Wraps an opaque predicate; `true` means valid.
#[derive(Clone)]
pub struct Predicate {
    name: String,
    kind: String,
    message: String,
    check: Arc<PredicateFn>,
}

impl Predicate {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
        check: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            message: message.into(),
            check: Arc::new(check),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Validator for Predicate {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, value: &Value, _ctx: &ValidationContext<'_>) -> ValidationResult {
        if (self.check)(value) {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid(ValidationError::new(&*self.kind, &*self.message))
        }
    }
}

/// Cross-field check for a group: two named children must hold equal values.
///
/// The error lands on the group carrying this validator, never on either
/// child.
#[derive(Debug, Clone)]
pub struct FieldsMatch {
    first: String,
    second: String,
    kind: String,
    name: String,
}

impl FieldsMatch {
    #[must_use]
    pub fn new(first: impl Into<String>, second: impl Into<String>) -> Self {
        let first = first.into();
        let second = second.into();
        let name = format!("{ERROR_KIND_FIELDS_MATCH}:{first}={second}");
        Self {
            first,
            second,
            kind: ERROR_KIND_FIELDS_MATCH.to_string(),
            name,
        }
    }

    /// Report mismatches under a custom error kind.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

impl Validator for FieldsMatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, value: &Value, _ctx: &ValidationContext<'_>) -> ValidationResult {
        let first = value.get(&self.first).unwrap_or(&Value::Null);
        let second = value.get(&self.second).unwrap_or(&Value::Null);
        if first == second {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid(
                ValidationError::new(&*self.kind, "{first} and {second} must match")
                    .with_param("first", self.first.as_str())
                    .with_param("second", self.second.as_str())
                    .with_param("mismatch", true),
            )
        }
    }
}
