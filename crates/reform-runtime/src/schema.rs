#![forbid(unsafe_code)]

//! Declarative tree shapes.
//!
//! A schema describes the nodes built eagerly at engine construction and
//! the templates instantiated later when arrays and records grow.
//!
//! ```rust
//! use reform_core::validation::{MinLength, Required};
//! use reform_runtime::schema::{ArraySchema, ControlSchema, GroupSchema};
//! use serde_json::json;
//!
//! let phone = GroupSchema::new()
//!     .child("label", ControlSchema::new(json!("Mobile")))
//!     .child("phone", ControlSchema::new(json!("")).validator(Required::new()));
//!
//! let form = GroupSchema::new()
//!     .child("firstName", ControlSchema::new(json!("Dmytro")).validator(MinLength::new(4)))
//!     .child("phones", ArraySchema::new().template(phone.clone()).item(phone));
//! # let _ = form;
//! ```

use std::sync::Arc;
use std::time::Duration;

use reform_core::validation::{AsyncValidator, SharedAsyncValidator, SharedValidator, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// When a control commits written values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOn {
    /// Every write commits.
    #[default]
    Change,
    /// Writes are held until the control is blurred.
    Blur,
    /// Writes are held until the form is submitted.
    Submit,
}

/// An async validator plus its debounce window.
#[derive(Clone)]
pub struct AsyncSpec {
    pub validator: SharedAsyncValidator,
    /// `None` falls back to the engine's default window.
    pub debounce: Option<Duration>,
}

impl std::fmt::Debug for AsyncSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSpec")
            .field("validator", &self.validator.name())
            .field("debounce", &self.debounce)
            .finish()
    }
}

/// Validators and flags shared by every node shape.
#[derive(Clone, Default)]
pub(crate) struct Bindings {
    pub(crate) validators: Vec<SharedValidator>,
    pub(crate) async_validators: Vec<AsyncSpec>,
    pub(crate) disabled: bool,
}

impl std::fmt::Debug for Bindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bindings")
            .field(
                "validators",
                &self.validators.iter().map(|v| v.name()).collect::<Vec<_>>(),
            )
            .field("async_validators", &self.async_validators)
            .field("disabled", &self.disabled)
            .finish()
    }
}

macro_rules! binding_builders {
    ($ty:ty) => {
        impl $ty {
            /// Attach a sync validator.
            #[must_use]
            pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
                self.bindings.validators.push(Arc::new(validator));
                self
            }

            /// Attach an already shared sync validator.
            #[must_use]
            pub fn shared_validator(mut self, validator: SharedValidator) -> Self {
                self.bindings.validators.push(validator);
                self
            }

            /// Attach an async validator using the engine's default debounce.
            #[must_use]
            pub fn async_validator(mut self, validator: impl AsyncValidator + 'static) -> Self {
                self.bindings.async_validators.push(AsyncSpec {
                    validator: Arc::new(validator),
                    debounce: None,
                });
                self
            }

            /// Attach an async validator with its own debounce window.
            #[must_use]
            pub fn async_validator_debounced(
                mut self,
                validator: impl AsyncValidator + 'static,
                debounce: Duration,
            ) -> Self {
                self.bindings.async_validators.push(AsyncSpec {
                    validator: Arc::new(validator),
                    debounce: Some(debounce),
                });
                self
            }

            /// Start disabled.
            #[must_use]
            pub fn disabled(mut self) -> Self {
                self.bindings.disabled = true;
                self
            }
        }
    };
}

/// A leaf holding a value.
#[derive(Debug, Clone)]
pub struct ControlSchema {
    pub(crate) initial: Value,
    pub(crate) update_on: UpdateOn,
    pub(crate) bindings: Bindings,
}

impl ControlSchema {
    #[must_use]
    pub fn new(initial: Value) -> Self {
        Self {
            initial,
            update_on: UpdateOn::Change,
            bindings: Bindings::default(),
        }
    }

    #[must_use]
    pub fn update_on(mut self, update_on: UpdateOn) -> Self {
        self.update_on = update_on;
        self
    }
}

binding_builders!(ControlSchema);

/// A fixed set of named children.
#[derive(Debug, Clone, Default)]
pub struct GroupSchema {
    pub(crate) children: Vec<(String, NodeSchema)>,
    pub(crate) bindings: Bindings,
}

impl GroupSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named child. A repeated key replaces the earlier child.
    #[must_use]
    pub fn child(mut self, key: impl Into<String>, schema: impl Into<NodeSchema>) -> Self {
        let key = key.into();
        let schema = schema.into();
        match self.children.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = schema,
            None => self.children.push((key, schema)),
        }
        self
    }
}

binding_builders!(GroupSchema);

/// A positional list of children.
#[derive(Debug, Clone, Default)]
pub struct ArraySchema {
    pub(crate) items: Vec<NodeSchema>,
    pub(crate) template: Option<Box<NodeSchema>>,
    pub(crate) bindings: Bindings,
}

impl ArraySchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn item(mut self, schema: impl Into<NodeSchema>) -> Self {
        self.items.push(schema.into());
        self
    }

    /// Shape of items added with `push_item` / `insert_item`.
    #[must_use]
    pub fn template(mut self, schema: impl Into<NodeSchema>) -> Self {
        self.template = Some(Box::new(schema.into()));
        self
    }
}

binding_builders!(ArraySchema);

/// A keyed collection whose keys change at runtime.
#[derive(Debug, Clone, Default)]
pub struct RecordSchema {
    pub(crate) entries: Vec<(String, NodeSchema)>,
    pub(crate) template: Option<Box<NodeSchema>>,
    pub(crate) bindings: Bindings,
}

impl RecordSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entry(mut self, key: impl Into<String>, schema: impl Into<NodeSchema>) -> Self {
        let key = key.into();
        let schema = schema.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = schema,
            None => self.entries.push((key, schema)),
        }
        self
    }

    /// Shape of entries added by key (for example by a field source).
    #[must_use]
    pub fn template(mut self, schema: impl Into<NodeSchema>) -> Self {
        self.template = Some(Box::new(schema.into()));
        self
    }
}

binding_builders!(RecordSchema);

/// Any node shape.
#[derive(Debug, Clone)]
pub enum NodeSchema {
    Control(ControlSchema),
    Group(GroupSchema),
    Array(ArraySchema),
    Record(RecordSchema),
}

impl NodeSchema {
    pub(crate) fn bindings(&self) -> &Bindings {
        match self {
            Self::Control(s) => &s.bindings,
            Self::Group(s) => &s.bindings,
            Self::Array(s) => &s.bindings,
            Self::Record(s) => &s.bindings,
        }
    }

    /// The value a freshly built node of this shape holds.
    #[must_use]
    pub fn initial_value(&self) -> Value {
        match self {
            Self::Control(s) => s.initial.clone(),
            Self::Group(s) => Value::Object(
                s.children
                    .iter()
                    .filter(|(_, c)| !c.bindings().disabled)
                    .map(|(k, c)| (k.clone(), c.initial_value()))
                    .collect(),
            ),
            Self::Array(s) => Value::Array(
                s.items
                    .iter()
                    .filter(|c| !c.bindings().disabled)
                    .map(NodeSchema::initial_value)
                    .collect(),
            ),
            Self::Record(s) => Value::Object(
                s.entries
                    .iter()
                    .filter(|(_, c)| !c.bindings().disabled)
                    .map(|(k, c)| (k.clone(), c.initial_value()))
                    .collect(),
            ),
        }
    }
}

impl From<ControlSchema> for NodeSchema {
    fn from(schema: ControlSchema) -> Self {
        Self::Control(schema)
    }
}

impl From<GroupSchema> for NodeSchema {
    fn from(schema: GroupSchema) -> Self {
        Self::Group(schema)
    }
}

impl From<ArraySchema> for NodeSchema {
    fn from(schema: ArraySchema) -> Self {
        Self::Array(schema)
    }
}

impl From<RecordSchema> for NodeSchema {
    fn from(schema: RecordSchema) -> Self {
        Self::Record(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reform_core::validation::{Required, ThreadedCheck, ValidationResult};
    use serde_json::json;

    #[test]
    fn group_initial_value_composes_children() {
        let schema: NodeSchema = GroupSchema::new()
            .child("firstName", ControlSchema::new(json!("Dmytro")))
            .child(
                "address",
                GroupSchema::new().child("city", ControlSchema::new(json!("Kyiv"))),
            )
            .into();
        assert_eq!(
            schema.initial_value(),
            json!({"firstName": "Dmytro", "address": {"city": "Kyiv"}})
        );
    }

    #[test]
    fn disabled_children_are_left_out_of_initial_value() {
        let schema: NodeSchema = GroupSchema::new()
            .child("a", ControlSchema::new(json!(1)))
            .child("b", ControlSchema::new(json!(2)).disabled())
            .into();
        assert_eq!(schema.initial_value(), json!({"a": 1}));
    }

    #[test]
    fn repeated_child_key_replaces() {
        let schema = GroupSchema::new()
            .child("a", ControlSchema::new(json!(1)))
            .child("a", ControlSchema::new(json!(2)));
        assert_eq!(schema.children.len(), 1);
        assert_eq!(NodeSchema::from(schema).initial_value(), json!({"a": 2}));
    }

    #[test]
    fn builders_collect_bindings() {
        let schema = ControlSchema::new(json!(""))
            .update_on(UpdateOn::Blur)
            .validator(Required::new())
            .async_validator_debounced(
                ThreadedCheck::new("unique", |_| Ok(ValidationResult::Valid)),
                Duration::from_millis(500),
            );
        assert_eq!(schema.update_on, UpdateOn::Blur);
        assert_eq!(schema.bindings.validators.len(), 1);
        assert_eq!(
            schema.bindings.async_validators[0].debounce,
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn array_items_and_template() {
        let schema = ArraySchema::new()
            .template(ControlSchema::new(json!("")))
            .item(ControlSchema::new(json!("a")))
            .item(ControlSchema::new(json!("b")));
        assert!(schema.template.is_some());
        assert_eq!(NodeSchema::from(schema).initial_value(), json!(["a", "b"]));
    }
}
