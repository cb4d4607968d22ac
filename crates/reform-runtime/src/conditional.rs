#![forbid(unsafe_code)]

//! Validators attached and detached by the value of another field.
//!
//! A [`ConditionalRule`] watches a driver path. The predicate is re-run on
//! the first evaluation, whenever the driver's value differs from the last
//! one the rule saw, and whenever the target node is rebuilt (an array item
//! or record entry removed and added again). `true` makes sure the rule's
//! validator is on the target, `false` makes sure it is not, whatever the
//! schema attached. The engine evaluates rules at registration and after
//! every mutation, so programmatic writes, resets and structural edits drive
//! rules the same way user input does.

use std::fmt;
use std::sync::Arc;

use reform_core::path::FormPath;
use reform_core::validation::{SharedValidator, Validator};
use serde_json::Value;

use crate::tree::NodeId;

type DriverPredicate = dyn Fn(&Value) -> bool + Send + Sync;

/// `(driver, predicate, target, validator)`.
#[derive(Clone)]
pub struct ConditionalRule {
    pub(crate) driver: FormPath,
    pub(crate) target: FormPath,
    pub(crate) predicate: Arc<DriverPredicate>,
    pub(crate) validator: SharedValidator,
}

impl ConditionalRule {
    #[must_use]
    pub fn new(
        driver: impl Into<FormPath>,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
        target: impl Into<FormPath>,
        validator: impl Validator + 'static,
    ) -> Self {
        Self {
            driver: driver.into(),
            target: target.into(),
            predicate: Arc::new(predicate),
            validator: Arc::new(validator),
        }
    }

    #[must_use]
    pub fn driver(&self) -> &FormPath {
        &self.driver
    }

    #[must_use]
    pub fn target(&self) -> &FormPath {
        &self.target
    }

    /// Name of the validator this rule manages on the target.
    #[must_use]
    pub fn validator_name(&self) -> &str {
        self.validator.name()
    }

    /// Whether the validator should be attached for this driver value.
    #[must_use]
    pub fn wants_attached(&self, driver_value: &Value) -> bool {
        (self.predicate)(driver_value)
    }
}

impl fmt::Debug for ConditionalRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalRule")
            .field("driver", &self.driver)
            .field("target", &self.target)
            .field("validator", &self.validator.name())
            .finish_non_exhaustive()
    }
}

/// A registered rule plus what it last observed.
#[derive(Debug)]
pub(crate) struct RuleState {
    pub(crate) rule: ConditionalRule,
    last_driver: Option<Value>,
    last_target: Option<NodeId>,
}

impl RuleState {
    pub(crate) fn new(rule: ConditionalRule) -> Self {
        Self {
            rule,
            last_driver: None,
            last_target: None,
        }
    }

    /// Record the driver value and the target node. Returns the verdict if
    /// either changed since the last call, `None` if there is nothing to do.
    pub(crate) fn observe(&mut self, driver: Value, target: NodeId) -> Option<bool> {
        if self.last_target == Some(target) && self.last_driver.as_ref() == Some(&driver) {
            return None;
        }
        let wanted = self.rule.wants_attached(&driver);
        self.last_driver = Some(driver);
        self.last_target = Some(target);
        Some(wanted)
    }
}

/// Predicate over a birth-year driver: true when the person is at least
/// `min_age` years old in `current_year`.
///
/// Numbers and numeric strings are accepted; anything else is "not old
/// enough".
pub fn min_age_gate(min_age: i64, current_year: i64) -> impl Fn(&Value) -> bool + Send + Sync {
    move |value| {
        let year = match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        year.is_some_and(|year| current_year - year >= min_age)
    }
}
