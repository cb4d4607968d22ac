#![forbid(unsafe_code)]

//! Immutable value checkpoints.
//!
//! A [`Snapshot`] is a deep copy of the whole tree value, disabled controls
//! included. Restoring one goes through
//! [`FormEngine::reset_to`](crate::FormEngine::reset_to): paths present in
//! both the snapshot and the live tree are written back, live paths the
//! snapshot does not mention keep their value, and snapshot paths with no
//! live node are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frozen copy of a tree value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    value: Value,
}

impl Snapshot {
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        Self { value }
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Serialize for persistence.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Load a snapshot written by [`Snapshot::to_json`].
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl From<Value> for Snapshot {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_is_the_bare_value() {
        let snapshot = Snapshot::from_value(json!({"firstName": "ma9net", "phones": []}));
        let json = snapshot.to_json().unwrap();
        assert_eq!(json, r#"{"firstName":"ma9net","phones":[]}"#);
        assert_eq!(Snapshot::from_json(&json).unwrap(), snapshot);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(Snapshot::from_json("{not json").is_err());
    }
}
