#![forbid(unsafe_code)]

//! The form engine.
//!
//! [`FormEngine`] owns the control tree and is the only thing that mutates
//! it. Every public operation runs to completion on `&mut self`:
//!
//! 1. Apply the change (value write, structural edit, validator attach, ...)
//! 2. Re-run sync validation on the touched node and its ancestors, and
//!    (re)arm the debounce timers of their async validators
//! 3. Re-evaluate conditional rules whose driver changed
//! 4. Notify value listeners and check the root for settlement
//!
//! Async work happens out of band. [`FormEngine::tick`] is the only place
//! where due debounce windows are released to their validators and where
//! completions are drained, checked for staleness, and merged.
//!
//! # Example
//!
//! ```rust
//! use reform_core::validation::{MinLength, Required};
//! use reform_runtime::{ControlSchema, ControlStatus, FormEngine, GroupSchema};
//! use serde_json::json;
//!
//! let schema = GroupSchema::new()
//!     .child("firstName", ControlSchema::new(json!("ma9net")).validator(MinLength::new(4)))
//!     .child("lastName", ControlSchema::new(json!("Hadi")).validator(Required::new()));
//! let mut form = FormEngine::new(schema);
//! assert_eq!(form.root_status(), ControlStatus::Valid);
//!
//! form.set_value("firstName", "ma9").unwrap();
//! assert!(form.has_error("firstName", "minlength"));
//! assert_eq!(form.root_status(), ControlStatus::Invalid);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, mpsc};
use std::time::Duration;

use reform_core::path::{FormPath, PathSegment};
use reform_core::validation::{
    ApplyDecision, AsyncOutcome, AsyncReply, AsyncValidator, ErrorMap, FieldLookup,
    InfrastructureError, SharedValidator, ValidationContext, ValidationError, ValidationResult,
    ValidationToken, ValidationTrace, Validator,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::conditional::{ConditionalRule, RuleState};
use crate::config::EngineConfig;
use crate::error::{FormError, FormResult};
use crate::events::{Listeners, SubId, TickReport, ValidationInfrastructureError};
use crate::provider::{self, FieldKeySource, KeyDelivery, RunningSource};
use crate::schema::{NodeSchema, UpdateOn};
use crate::snapshot::Snapshot;
use crate::status::{ControlStatus, Settled, SettlementDetector};
use crate::tree::{BindingId, FormTree, Node, NodeId, NodeKind, NodeKindTag};

/// How a value write is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetValueOptions {
    /// Commit immediately even if the control updates on blur or submit.
    pub force: bool,
    /// Mark written controls dirty.
    pub mark_dirty: bool,
    /// Call value listeners for this write.
    pub emit_event: bool,
}

impl Default for SetValueOptions {
    fn default() -> Self {
        Self {
            force: false,
            mark_dirty: true,
            emit_event: true,
        }
    }
}

impl SetValueOptions {
    /// A write made by the host rather than the user: commits immediately
    /// and leaves `dirty` alone.
    #[must_use]
    pub fn programmatic() -> Self {
        Self {
            force: true,
            mark_dirty: false,
            emit_event: true,
        }
    }

}

/// Result of [`FormEngine::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The form was valid; the submitted value is the new checkpoint.
    Submitted(Snapshot),
    /// The root was not valid.
    Blocked(ControlStatus),
    /// The form is valid, but the async checks of these nodes failed to run
    /// and have not been retried since.
    Unverified(Vec<FormPath>),
}

/// Observable state of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub path: FormPath,
    pub kind: NodeKindTag,
    pub value: Value,
    pub status: ControlStatus,
    pub errors: ErrorMap,
    pub dirty: bool,
    pub touched: bool,
    /// A written value is held until blur or submit.
    pub has_pending_input: bool,
    /// Async validators whose last evaluation failed, with the failure.
    pub async_failures: BTreeMap<String, String>,
}

/// A resolved async evaluation on its way back to the engine.
struct Completion {
    node: NodeId,
    binding: BindingId,
    token: ValidationToken,
    outcome: AsyncOutcome,
}

/// Builder for [`FormEngine`].
pub struct FormEngineBuilder {
    schema: NodeSchema,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    rules: Vec<ConditionalRule>,
}

impl FormEngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    #[must_use]
    pub fn rule(mut self, rule: ConditionalRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Build the tree, run full validation, register the rules and capture
    /// the `initial` checkpoint.
    pub fn build(self) -> FormResult<FormEngine> {
        let mut engine = FormEngine::construct(self.schema, self.config, self.clock);
        for rule in self.rules {
            engine.add_rule(rule)?;
        }
        Ok(engine)
    }
}

impl fmt::Debug for FormEngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormEngineBuilder")
            .field("config", &self.config)
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

/// A reactive control tree with debounced async validation.
pub struct FormEngine {
    tree: FormTree,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    rules: Vec<RuleState>,
    listeners: Listeners,
    settlement: SettlementDetector,
    completions_tx: mpsc::Sender<Completion>,
    completions_rx: mpsc::Receiver<Completion>,
    deliveries_tx: mpsc::Sender<KeyDelivery>,
    deliveries_rx: mpsc::Receiver<KeyDelivery>,
    sources: Vec<RunningSource>,
    next_source: SubId,
    report: TickReport,
    initial: Snapshot,
    last_submitted: Option<Snapshot>,
}

impl FormEngine {
    /// Build with the default configuration and the system clock.
    #[must_use]
    pub fn new(schema: impl Into<NodeSchema>) -> Self {
        Self::construct(
            schema.into(),
            EngineConfig::default(),
            Arc::new(SystemClock::new()),
        )
    }

    #[must_use]
    pub fn builder(schema: impl Into<NodeSchema>) -> FormEngineBuilder {
        FormEngineBuilder {
            schema: schema.into(),
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock::new()),
            rules: Vec::new(),
        }
    }

    fn construct(schema: NodeSchema, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let tree = FormTree::new(&schema, config.default_debounce, config.trace_capacity());
        let (completions_tx, completions_rx) = mpsc::channel();
        let (deliveries_tx, deliveries_rx) = mpsc::channel();
        let mut engine = Self {
            tree,
            config,
            clock,
            rules: Vec::new(),
            listeners: Listeners::default(),
            settlement: SettlementDetector::new(ControlStatus::Valid),
            completions_tx,
            completions_rx,
            deliveries_tx,
            deliveries_rx,
            sources: Vec::new(),
            next_source: 0,
            report: TickReport::default(),
            initial: Snapshot::from_value(Value::Null),
            last_submitted: None,
        };
        let root = engine.tree.root();
        engine.validate_subtree(root);
        engine.initial = engine.snapshot();
        engine.after_mutation(true);
        info!(
            nodes = engine.tree.node_ids().len(),
            status = %engine.root_status(),
            "form engine built"
        );
        engine
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn now(&self) -> Duration {
        self.clock.elapsed()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    fn node_at(&self, path: &FormPath) -> FormResult<(NodeId, &Node)> {
        let id = self.tree.resolve(path)?;
        let node = self
            .tree
            .node(id)
            .ok_or_else(|| FormError::NotFound { path: path.clone() })?;
        Ok((id, node))
    }

    /// Everything observable about one node.
    pub fn state(&self, path: impl Into<FormPath>) -> FormResult<NodeState> {
        let path = path.into();
        let (id, node) = self.node_at(&path)?;
        Ok(NodeState {
            kind: node.kind.tag(),
            value: self.tree.value(id),
            status: node.status,
            errors: node.errors.clone(),
            dirty: node.dirty,
            touched: node.touched,
            has_pending_input: matches!(
                node.kind,
                NodeKind::Control {
                    pending_input: Some(_),
                    ..
                }
            ),
            async_failures: node
                .bindings
                .iter()
                .filter_map(|b| {
                    b.failure
                        .as_ref()
                        .map(|f| (b.name().to_string(), f.to_string()))
                })
                .collect(),
            path,
        })
    }

    /// Composed value, disabled descendants left out.
    pub fn value(&self, path: impl Into<FormPath>) -> FormResult<Value> {
        let id = self.tree.resolve(&path.into())?;
        Ok(self.tree.value(id))
    }

    /// Composed value including disabled descendants.
    pub fn raw_value(&self, path: impl Into<FormPath>) -> FormResult<Value> {
        let id = self.tree.resolve(&path.into())?;
        Ok(self.tree.raw_value(id))
    }

    /// Value of the whole form.
    #[must_use]
    pub fn form_value(&self) -> Value {
        self.tree.value(self.tree.root())
    }

    pub fn status(&self, path: impl Into<FormPath>) -> FormResult<ControlStatus> {
        Ok(self.node_at(&path.into())?.1.status)
    }

    /// The aggregate a view layer uses to enable submission.
    #[must_use]
    pub fn root_status(&self) -> ControlStatus {
        self.tree
            .node(self.tree.root())
            .map_or(ControlStatus::Valid, |n| n.status)
    }

    pub fn errors(&self, path: impl Into<FormPath>) -> FormResult<ErrorMap> {
        Ok(self.node_at(&path.into())?.1.errors.clone())
    }

    /// The error of `kind` on the node at `path`, if both exist.
    #[must_use]
    pub fn error(&self, path: impl Into<FormPath>, kind: &str) -> Option<ValidationError> {
        self.node_at(&path.into())
            .ok()
            .and_then(|(_, node)| node.errors.get(kind).cloned())
    }

    #[must_use]
    pub fn has_error(&self, path: impl Into<FormPath>, kind: &str) -> bool {
        self.error(path, kind).is_some()
    }

    /// An error worth showing: present, and the user has interacted with the
    /// node.
    #[must_use]
    pub fn should_show_error(&self, path: impl Into<FormPath>, kind: &str) -> bool {
        self.node_at(&path.into())
            .is_ok_and(|(_, node)| node.errors.contains(kind) && (node.dirty || node.touched))
    }

    pub fn is_dirty(&self, path: impl Into<FormPath>) -> FormResult<bool> {
        Ok(self.node_at(&path.into())?.1.dirty)
    }

    pub fn is_touched(&self, path: impl Into<FormPath>) -> FormResult<bool> {
        Ok(self.node_at(&path.into())?.1.touched)
    }

    /// The value held back by a blur/submit control, if any.
    pub fn pending_input(&self, path: impl Into<FormPath>) -> FormResult<Option<Value>> {
        let path = path.into();
        match &self.node_at(&path)?.1.kind {
            NodeKind::Control { pending_input, .. } => Ok(pending_input.clone()),
            _ => Err(FormError::NotAControl { path }),
        }
    }

    /// Names of the sync validators attached to a node, in order.
    pub fn validator_names(&self, path: impl Into<FormPath>) -> FormResult<Vec<String>> {
        Ok(self
            .node_at(&path.into())?
            .1
            .validators
            .iter()
            .map(|v| v.name().to_string())
            .collect())
    }

    /// Transport failure of the last evaluation of an async validator.
    pub fn async_failure(
        &self,
        path: impl Into<FormPath>,
        validator: &str,
    ) -> FormResult<Option<InfrastructureError>> {
        Ok(self
            .node_at(&path.into())?
            .1
            .bindings
            .iter()
            .find(|b| b.name() == validator)
            .and_then(|b| b.failure.clone()))
    }

    /// Lifecycle trace of an async validator binding.
    pub fn async_trace(
        &self,
        path: impl Into<FormPath>,
        validator: &str,
    ) -> FormResult<Option<&ValidationTrace>> {
        Ok(self
            .node_at(&path.into())?
            .1
            .bindings
            .iter()
            .find(|b| b.name() == validator)
            .map(|b| b.coordinator.trace()))
    }

    /// Time until the next debounce window closes, `None` if nothing is
    /// scheduled.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        let now = self.now();
        self.tree
            .node_ids()
            .into_iter()
            .filter_map(|id| self.tree.node(id))
            .flat_map(|node| node.bindings.iter())
            .filter_map(|b| b.timer.time_until_fire(now))
            .min()
    }

    /// Enabled nodes with an async validator whose last evaluation failed.
    #[must_use]
    pub fn unverified_paths(&self) -> Vec<FormPath> {
        self.tree
            .node_ids()
            .into_iter()
            .filter(|id| {
                self.tree.node(*id).is_some_and(|node| {
                    !node.disabled && node.bindings.iter().any(|b| b.failure.is_some())
                })
            })
            .filter_map(|id| self.tree.path_of(id))
            .collect()
    }

    /// No async evaluation is scheduled or outstanding anywhere.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.tree
            .node_ids()
            .into_iter()
            .filter_map(|id| self.tree.node(id))
            .all(|node| !node.own_pending())
    }

    // -----------------------------------------------------------------------
    // Values and interaction
    // -----------------------------------------------------------------------

    /// Write a value as user input.
    pub fn set_value(&mut self, path: impl Into<FormPath>, value: impl Into<Value>) -> FormResult<()> {
        self.set_value_with(path, value, SetValueOptions::default())
    }

    /// Write a value. On a composite the value is a patch: each control
    /// addressed by the value is written, the rest are left alone.
    pub fn set_value_with(
        &mut self,
        path: impl Into<FormPath>,
        value: impl Into<Value>,
        options: SetValueOptions,
    ) -> FormResult<()> {
        let path = path.into();
        let value = value.into();
        let id = self.tree.resolve(&path)?;

        let mut writes = Vec::new();
        self.tree.collect_writes(id, &value, &mut writes);
        let mut committed = Vec::new();
        for (control, part) in writes {
            if self.write_control(control, part, options) {
                committed.push(control);
            }
        }
        trace!(%path, committed = committed.len(), "value written");
        for control in committed {
            self.validate_upward(control);
        }
        self.after_mutation(options.emit_event);
        Ok(())
    }

    /// Returns whether the value was committed (as opposed to held).
    fn write_control(&mut self, id: NodeId, value: Value, options: SetValueOptions) -> bool {
        let Some(node) = self.tree.node_mut(id) else {
            return false;
        };
        if options.mark_dirty {
            node.dirty = true;
        }
        let NodeKind::Control {
            value: slot,
            pending_input,
            update_on,
        } = &mut node.kind
        else {
            return false;
        };
        if *update_on != UpdateOn::Change && !options.force {
            *pending_input = Some(value);
            return false;
        }
        *pending_input = None;
        *slot = value;
        true
    }

    /// Commit a held input, if the control has one.
    fn commit_pending(&mut self, id: NodeId, only: Option<UpdateOn>) -> bool {
        let Some(Node {
            kind:
                NodeKind::Control {
                    value,
                    pending_input,
                    update_on,
                },
            ..
        }) = self.tree.node_mut(id)
        else {
            return false;
        };
        if only.is_some_and(|policy| policy != *update_on) {
            return false;
        }
        match pending_input.take() {
            Some(held) => {
                *value = held;
                true
            }
            None => false,
        }
    }

    pub fn mark_touched(&mut self, path: impl Into<FormPath>) -> FormResult<()> {
        let id = self.tree.resolve(&path.into())?;
        if let Some(node) = self.tree.node_mut(id) {
            node.touched = true;
        }
        Ok(())
    }

    pub fn mark_dirty(&mut self, path: impl Into<FormPath>) -> FormResult<()> {
        let id = self.tree.resolve(&path.into())?;
        if let Some(node) = self.tree.node_mut(id) {
            node.dirty = true;
        }
        Ok(())
    }

    /// The user left the control: mark it touched and commit an input held
    /// for blur.
    pub fn blur(&mut self, path: impl Into<FormPath>) -> FormResult<()> {
        let path = path.into();
        let id = self.tree.resolve(&path)?;
        if let Some(node) = self.tree.node_mut(id) {
            node.touched = true;
        }
        if self.commit_pending(id, Some(UpdateOn::Blur)) {
            trace!(%path, "held input committed on blur");
            self.validate_upward(id);
        }
        self.after_mutation(true);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Validators
    // -----------------------------------------------------------------------

    /// Attach a sync validator. Returns `false` if one with the same name is
    /// already attached. The node is re-validated either way.
    pub fn add_validator(
        &mut self,
        path: impl Into<FormPath>,
        validator: impl Validator + 'static,
    ) -> FormResult<bool> {
        self.add_shared_validator(path, Arc::new(validator))
    }

    pub fn add_shared_validator(
        &mut self,
        path: impl Into<FormPath>,
        validator: SharedValidator,
    ) -> FormResult<bool> {
        let path = path.into();
        let id = self.tree.resolve(&path)?;
        let name = validator.name().to_string();
        let added = self.attach_validator(id, validator);
        debug!(%path, validator = %name, added, "sync validator attached");
        self.validate_upward(id);
        self.after_mutation(true);
        Ok(added)
    }

    /// Detach a sync validator by name. Returns whether one was attached.
    pub fn remove_validator(&mut self, path: impl Into<FormPath>, name: &str) -> FormResult<bool> {
        let path = path.into();
        let id = self.tree.resolve(&path)?;
        let removed = self.detach_validator(id, name);
        debug!(%path, validator = name, removed, "sync validator detached");
        self.validate_upward(id);
        self.after_mutation(true);
        Ok(removed)
    }

    fn attach_validator(&mut self, id: NodeId, validator: SharedValidator) -> bool {
        let Some(node) = self.tree.node_mut(id) else {
            return false;
        };
        if node.validators.iter().any(|v| v.name() == validator.name()) {
            return false;
        }
        node.validators.push(validator);
        true
    }

    fn detach_validator(&mut self, id: NodeId, name: &str) -> bool {
        let Some(node) = self.tree.node_mut(id) else {
            return false;
        };
        let before = node.validators.len();
        node.validators.retain(|v| v.name() != name);
        before != node.validators.len()
    }

    /// Attach an async validator. `debounce` of `None` uses the configured
    /// default window. Returns `false` if one with the same name exists.
    pub fn add_async_validator(
        &mut self,
        path: impl Into<FormPath>,
        validator: impl AsyncValidator + 'static,
        debounce: Option<Duration>,
    ) -> FormResult<bool> {
        let path = path.into();
        let id = self.tree.resolve(&path)?;
        let name = validator.name().to_string();
        let exists = self
            .tree
            .node(id)
            .is_some_and(|n| n.bindings.iter().any(|b| b.name() == name));
        if !exists {
            let binding = self.tree.make_binding(Arc::new(validator), debounce);
            if let Some(node) = self.tree.node_mut(id) {
                node.bindings.push(binding);
            }
        }
        debug!(%path, validator = %name, added = !exists, "async validator attached");
        self.validate_upward(id);
        self.after_mutation(true);
        Ok(!exists)
    }

    /// Detach an async validator by name, cancelling its timer and any
    /// in-flight evaluation.
    pub fn remove_async_validator(
        &mut self,
        path: impl Into<FormPath>,
        name: &str,
    ) -> FormResult<bool> {
        let path = path.into();
        let id = self.tree.resolve(&path)?;
        let now = self.now();
        let mut removed = false;
        if let Some(node) = self.tree.node_mut(id) {
            if let Some(pos) = node.bindings.iter().position(|b| b.name() == name) {
                let mut binding = node.bindings.remove(pos);
                binding.cancel(now);
                removed = true;
            }
        }
        debug!(%path, validator = name, removed, "async validator detached");
        self.validate_upward(id);
        self.after_mutation(true);
        Ok(removed)
    }

    /// Register a conditional rule and evaluate it immediately.
    pub fn add_rule(&mut self, rule: ConditionalRule) -> FormResult<()> {
        self.tree.resolve(rule.driver())?;
        self.tree.resolve(rule.target())?;
        debug!(
            driver = %rule.driver(),
            target = %rule.target(),
            validator = rule.validator_name(),
            "conditional rule registered"
        );
        self.rules.push(RuleState::new(rule));
        self.after_mutation(true);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Structure
    // -----------------------------------------------------------------------

    /// Add a named child to a group or record.
    pub fn add_child(
        &mut self,
        parent: impl Into<FormPath>,
        key: &str,
        schema: impl Into<NodeSchema>,
    ) -> FormResult<FormPath> {
        let parent = parent.into();
        let id = self.tree.resolve(&parent)?;
        let child = self.tree.add_keyed(id, key, &schema.into())?;
        self.validate_subtree(child);
        debug!(%parent, key, "child added");
        self.after_mutation(true);
        Ok(parent.child(key))
    }

    /// Add an entry to a record from its template.
    pub fn add_entry(&mut self, record: impl Into<FormPath>, key: &str) -> FormResult<FormPath> {
        let record = record.into();
        let id = self.tree.resolve(&record)?;
        self.expect_kind(id, &record, NodeKindTag::Record)?;
        let template = self.tree.template(id)?;
        self.add_child(record, key, template)
    }

    /// Remove a child of any composite. Its async work is cancelled.
    pub fn remove_child(
        &mut self,
        parent: impl Into<FormPath>,
        segment: impl Into<PathSegment>,
    ) -> FormResult<()> {
        let parent = parent.into();
        let segment = segment.into();
        let id = self.tree.resolve(&parent)?;
        let now = self.now();
        let dropped = self.tree.remove_child(id, &segment)?;
        for mut node in dropped {
            for binding in &mut node.bindings {
                binding.cancel(now);
            }
        }
        debug!(%parent, %segment, "child removed");
        self.validate_upward(id);
        self.after_mutation(true);
        Ok(())
    }

    /// Append an item built from the array's template.
    pub fn push_item(&mut self, array: impl Into<FormPath>) -> FormResult<FormPath> {
        let array = array.into();
        let id = self.tree.resolve(&array)?;
        let len = self.tree.array_len(id, &array)?;
        self.insert_item(array, len)
    }

    /// Insert an item built from the array's template at `index`.
    pub fn insert_item(&mut self, array: impl Into<FormPath>, index: usize) -> FormResult<FormPath> {
        let array = array.into();
        let id = self.tree.resolve(&array)?;
        self.tree.array_len(id, &array)?;
        let template = self.tree.template(id)?;
        self.insert_item_with(array, index, template)
    }

    /// Insert an item of an explicit shape at `index`, shifting later items.
    pub fn insert_item_with(
        &mut self,
        array: impl Into<FormPath>,
        index: usize,
        schema: impl Into<NodeSchema>,
    ) -> FormResult<FormPath> {
        let array = array.into();
        let id = self.tree.resolve(&array)?;
        let child = self.tree.insert_item(id, index, &schema.into())?;
        self.validate_subtree(child);
        debug!(%array, index, "item inserted");
        self.after_mutation(true);
        Ok(array.child(index))
    }

    pub fn remove_item(&mut self, array: impl Into<FormPath>, index: usize) -> FormResult<()> {
        let array = array.into();
        let id = self.tree.resolve(&array)?;
        self.tree.array_len(id, &array)?;
        self.remove_child(array, index)
    }

    fn expect_kind(&self, id: NodeId, path: &FormPath, expected: NodeKindTag) -> FormResult<()> {
        let actual = self
            .tree
            .node(id)
            .map(|n| n.kind.tag())
            .ok_or_else(|| FormError::NotFound { path: path.clone() })?;
        if actual == expected {
            Ok(())
        } else if actual == NodeKindTag::Control {
            Err(FormError::NotAComposite { path: path.clone() })
        } else {
            Err(FormError::WrongKind {
                path: path.clone(),
                expected,
                actual,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Enable / disable / revalidate
    // -----------------------------------------------------------------------

    /// Disable a node and its descendants. Disabled nodes drop out of their
    /// parents' value and status, and their async work is cancelled.
    pub fn disable(&mut self, path: impl Into<FormPath>) -> FormResult<()> {
        self.set_disabled(path.into(), true)
    }

    pub fn enable(&mut self, path: impl Into<FormPath>) -> FormResult<()> {
        self.set_disabled(path.into(), false)
    }

    fn set_disabled(&mut self, path: FormPath, disabled: bool) -> FormResult<()> {
        let id = self.tree.resolve(&path)?;
        for node_id in self.tree.subtree(id) {
            if let Some(node) = self.tree.node_mut(node_id) {
                node.disabled = disabled;
            }
        }
        debug!(%path, disabled, "enablement changed");
        self.validate_subtree(id);
        self.after_mutation(true);
        Ok(())
    }

    /// Re-run sync and async validation of a subtree, bypassing the async
    /// dedupe cache. Use after an infrastructure failure to try again.
    pub fn revalidate(&mut self, path: impl Into<FormPath>) -> FormResult<()> {
        let path = path.into();
        let id = self.tree.resolve(&path)?;
        for node_id in self.tree.subtree(id) {
            if let Some(node) = self.tree.node_mut(node_id) {
                for binding in &mut node.bindings {
                    binding.coordinator.invalidate_cache();
                }
            }
        }
        debug!(%path, "revalidating");
        self.validate_subtree(id);
        self.after_mutation(true);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Snapshots, reset, submit
    // -----------------------------------------------------------------------

    /// Deep copy of the whole form value, disabled controls included.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::from_value(self.tree.raw_value(self.tree.root()))
    }

    /// The checkpoint taken at construction (and after field deliveries).
    #[must_use]
    pub fn initial_snapshot(&self) -> &Snapshot {
        &self.initial
    }

    /// The checkpoint taken at the last successful submit.
    #[must_use]
    pub fn last_submitted(&self) -> Option<&Snapshot> {
        self.last_submitted.as_ref()
    }

    /// Restore values from `snapshot`, clear interaction state, cancel async
    /// work and re-run full validation. Never fails: paths missing on either
    /// side are skipped.
    pub fn reset_to(&mut self, snapshot: &Snapshot) {
        let now = self.now();
        for id in self.tree.node_ids() {
            let Some(node) = self.tree.node_mut(id) else {
                continue;
            };
            node.dirty = false;
            node.touched = false;
            if let NodeKind::Control { pending_input, .. } = &mut node.kind {
                *pending_input = None;
            }
            for binding in &mut node.bindings {
                binding.cancel(now);
                binding.failure = None;
            }
        }

        let root = self.tree.root();
        let mut writes = Vec::new();
        self.tree.collect_writes(root, snapshot.value(), &mut writes);
        for (id, value) in writes {
            if let Some(Node {
                kind: NodeKind::Control { value: slot, .. },
                ..
            }) = self.tree.node_mut(id)
            {
                *slot = value;
            }
        }
        self.validate_subtree(root);
        debug!(status = %self.root_status(), "form reset");
        self.after_mutation(true);
    }

    /// Reset to the last submitted value, or the initial one if nothing was
    /// submitted yet.
    pub fn reset(&mut self) {
        let snapshot = self
            .last_submitted
            .clone()
            .unwrap_or_else(|| self.initial.clone());
        self.reset_to(&snapshot);
    }

    /// Commit held inputs and, if the form is valid, record the value as the
    /// `last_submitted` checkpoint and reset the form to it.
    pub fn submit(&mut self) -> SubmitOutcome {
        let mut committed = Vec::new();
        for id in self.tree.node_ids() {
            if self.commit_pending(id, None) {
                committed.push(id);
            }
        }
        for id in committed {
            self.validate_upward(id);
        }
        self.after_mutation(true);

        let status = self.root_status();
        if status != ControlStatus::Valid {
            debug!(%status, "submit blocked");
            return SubmitOutcome::Blocked(status);
        }
        let unverified = self.unverified_paths();
        if !unverified.is_empty() {
            debug!(nodes = unverified.len(), "submit blocked on failed async checks");
            return SubmitOutcome::Unverified(unverified);
        }
        let snapshot = self.snapshot();
        self.last_submitted = Some(snapshot.clone());
        self.reset_to(&snapshot);
        info!("form submitted");
        SubmitOutcome::Submitted(snapshot)
    }

    // -----------------------------------------------------------------------
    // Dynamic fields
    // -----------------------------------------------------------------------

    /// Add one control per unseen key to a record, from its entry template.
    /// Existing entries are left untouched. Returns the added paths.
    pub fn apply_field_keys<I, S>(
        &mut self,
        record: impl Into<FormPath>,
        keys: I,
    ) -> FormResult<Vec<FormPath>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let record = record.into();
        let added = self.add_entries(&record, keys.into_iter().map(Into::into).collect())?;
        self.after_mutation(true);
        Ok(added)
    }

    fn add_entries(&mut self, record: &FormPath, keys: Vec<String>) -> FormResult<Vec<FormPath>> {
        let id = self.tree.resolve(record)?;
        self.expect_kind(id, record, NodeKindTag::Record)?;
        let template = self.tree.template(id)?;

        let mut added = Vec::new();
        for key in keys {
            let path = record.child(key.as_str());
            if self.tree.resolve(&path).is_ok() {
                continue;
            }
            let child = self.tree.add_keyed(id, &key, &template)?;
            for node_id in self.tree.subtree_post_order(child) {
                self.validate_node(node_id);
            }
            added.push(path);
        }
        if added.is_empty() {
            return Ok(added);
        }

        self.validate_upward(id);
        debug!(%record, added = added.len(), "field keys applied");
        if self.config.recapture_initial_on_delivery {
            self.initial = self.snapshot();
        }
        self.report.fields_added.extend(added.iter().cloned());
        Ok(added)
    }

    /// Run `source` on a background thread feeding keys into `record`.
    /// Deliveries are applied on [`tick`](Self::tick).
    pub fn connect_field_source(
        &mut self,
        record: impl Into<FormPath>,
        source: impl FieldKeySource,
    ) -> FormResult<SubId> {
        let record = record.into();
        let id = self.tree.resolve(&record)?;
        self.expect_kind(id, &record, NodeKindTag::Record)?;
        self.tree.template(id)?;

        self.next_source += 1;
        let sub_id = self.next_source;
        let sender = provider::channel(record.clone(), &self.deliveries_tx);
        self.sources
            .push(RunningSource::spawn(sub_id, Box::new(source), sender));
        debug!(sub_id, %record, "field source connected");
        Ok(sub_id)
    }

    /// Stop a field source. Returns whether it was running.
    pub fn disconnect_field_source(&mut self, id: SubId) -> bool {
        match self.sources.iter().position(|s| s.id == id) {
            Some(pos) => {
                self.sources.remove(pos).stop();
                debug!(sub_id = id, "field source disconnected");
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    /// Called once per transition of the root out of `Pending`.
    pub fn subscribe_settled(&mut self, callback: impl FnMut(Settled) + Send + 'static) -> SubId {
        self.listeners.subscribe_settled(Box::new(callback))
    }

    /// Called with the node's new value whenever it changes. The listener
    /// follows the node, not the path, and is dropped when the node is
    /// removed.
    pub fn subscribe_value_changes(
        &mut self,
        path: impl Into<FormPath>,
        callback: impl FnMut(&FormPath, &Value) + Send + 'static,
    ) -> FormResult<SubId> {
        let id = self.tree.resolve(&path.into())?;
        let current = self.tree.value(id);
        Ok(self
            .listeners
            .subscribe_value(id, current, Box::new(callback)))
    }

    pub fn unsubscribe(&mut self, id: SubId) -> bool {
        self.listeners.unsubscribe(id)
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Apply field deliveries, release closed debounce windows, merge async
    /// completions, and return everything that happened since the last tick.
    pub fn tick(&mut self) -> TickReport {
        self.drain_deliveries();
        self.fire_due_timers();
        self.drain_completions();
        self.after_mutation(true);
        std::mem::take(&mut self.report)
    }

    fn drain_deliveries(&mut self) {
        while let Ok(delivery) = self.deliveries_rx.try_recv() {
            if let Err(err) = self.add_entries(&delivery.record, delivery.keys) {
                warn!(record = %delivery.record, error = %err, "dropping field-key delivery");
            }
        }
    }

    fn fire_due_timers(&mut self) {
        let now = self.now();
        let mut issues = Vec::new();
        let mut fired = Vec::new();

        for id in self.tree.node_ids() {
            let Some(node) = self.tree.node_mut(id) else {
                continue;
            };
            let blocked = node.disabled || !node.sync_errors.is_empty();
            for binding in &mut node.bindings {
                let Some(value) = binding.timer.poll(now) else {
                    continue;
                };
                fired.push(id);
                if blocked {
                    continue;
                }
                let input = binding.validator.normalize(&value);
                if binding.coordinator.is_duplicate(&input) {
                    binding.coordinator.record_reuse(now);
                    self.report.reused += 1;
                    trace!(node = %id, validator = binding.name(), "async input unchanged, result reused");
                } else {
                    let token = binding.coordinator.start_validation(input, now);
                    self.report.issued += 1;
                    issues.push((id, binding.id, token, value, Arc::clone(&binding.validator)));
                }
            }
        }

        for (node, binding, token, value, validator) in issues {
            trace!(%node, validator = validator.name(), %token, "issuing async validation");
            let tx = self.completions_tx.clone();
            let reply = AsyncReply::new(token, move |token, outcome| {
                let sent = tx.send(Completion {
                    node,
                    binding,
                    token,
                    outcome,
                });
                if sent.is_err() {
                    trace!(%node, %token, "engine dropped, async result discarded");
                }
            });
            validator.validate(value, reply);
        }

        fired.dedup();
        for id in fired {
            self.tree.refresh_upward(id);
        }
    }

    fn drain_completions(&mut self) {
        let now = self.now();
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.apply_completion(completion, now);
        }
    }

    fn apply_completion(&mut self, completion: Completion, now: Duration) {
        let Completion {
            node: id,
            binding,
            token,
            outcome,
        } = completion;
        let Some(path) = self.tree.path_of(id) else {
            self.report.stale_discarded += 1;
            debug!(node = %id, %token, "completion for removed node discarded");
            return;
        };
        let Some(node) = self.tree.node_mut(id) else {
            return;
        };
        let Some(slot) = node.bindings.iter_mut().find(|b| b.id == binding) else {
            self.report.stale_discarded += 1;
            warn!(%path, %token, "completion for detached async validator discarded");
            return;
        };

        match slot.coordinator.try_apply_result(token, &outcome, now) {
            ApplyDecision::Applied => {
                slot.result = outcome.ok().and_then(ValidationResult::into_error);
                slot.failure = None;
                self.report.applied += 1;
                trace!(%path, validator = slot.name(), %token, invalid = slot.result.is_some(), "async result applied");
            }
            ApplyDecision::Failed => {
                if let Err(source) = outcome {
                    warn!(%path, validator = slot.name(), %token, error = %source, "async validation failed");
                    slot.result = None;
                    slot.failure = Some(source.clone());
                    self.report.failures.push(ValidationInfrastructureError {
                        path,
                        validator: slot.name().to_string(),
                        token,
                        source,
                    });
                }
            }
            ApplyDecision::StaleDiscarded { current } => {
                self.report.stale_discarded += 1;
                trace!(%path, %token, %current, "stale async result discarded");
                return;
            }
        }
        self.tree.refresh_upward(id);
    }

    // -----------------------------------------------------------------------
    // Validation and propagation
    // -----------------------------------------------------------------------

    /// Run sync validators on `id`, then arm or cancel its async bindings and
    /// recompute its status. Children must already be up to date.
    fn validate_node(&mut self, id: NodeId) {
        let Some(node) = self.tree.node(id) else {
            return;
        };
        let disabled = node.disabled;
        let validators = node.validators.clone();
        let value = self.tree.value(id);

        let mut errors = ErrorMap::new();
        if !disabled && !validators.is_empty() {
            let path = self.tree.path_of(id).unwrap_or_default();
            let ctx = ValidationContext::new(&path, &self.tree);
            for validator in &validators {
                if let ValidationResult::Invalid(error) = validator.validate(&value, &ctx) {
                    errors.insert_first_wins(error);
                }
            }
        }

        let now = self.now();
        let Some(node) = self.tree.node_mut(id) else {
            return;
        };
        let schedule = !disabled && errors.is_empty();
        node.sync_errors = errors;
        for binding in &mut node.bindings {
            if schedule {
                binding.coordinator.cancel(now);
                binding.failure = None;
                binding.timer.arm(value.clone(), now);
                trace!(node = %id, validator = binding.name(), window = ?binding.timer.window(), "async validation scheduled");
            } else {
                binding.cancel(now);
            }
        }
        self.tree.refresh_status(id);
    }

    /// Validate `id` and then every ancestor, whose composed values changed.
    fn validate_upward(&mut self, id: NodeId) {
        self.validate_node(id);
        for ancestor in self.tree.ancestors(id) {
            self.validate_node(ancestor);
        }
    }

    /// Validate a whole subtree bottom-up, then its ancestors.
    fn validate_subtree(&mut self, id: NodeId) {
        for node_id in self.tree.subtree_post_order(id) {
            self.validate_node(node_id);
        }
        for ancestor in self.tree.ancestors(id) {
            self.validate_node(ancestor);
        }
    }

    /// The common tail of every operation: rules, value listeners,
    /// settlement.
    fn after_mutation(&mut self, emit: bool) {
        self.apply_rules();
        self.listeners.notify_values(&self.tree, emit);
        let status = self.root_status();
        if let Some(settled) = self.settlement.observe(status) {
            info!(to = %settled.to, "form settled");
            self.report.settled.push(settled);
            self.listeners.emit_settled(settled);
        }
    }

    fn apply_rules(&mut self) {
        for index in 0..self.rules.len() {
            let (driver, target) = {
                let rule = &self.rules[index].rule;
                (rule.driver().clone(), rule.target().clone())
            };
            let Ok(target_id) = self.tree.resolve(&target) else {
                continue;
            };
            let driver_value = self.tree.value_at(&driver).unwrap_or(Value::Null);
            let Some(attach) = self.rules[index].observe(driver_value, target_id) else {
                continue;
            };
            let validator = Arc::clone(&self.rules[index].rule.validator);
            let name = validator.name().to_string();
            let changed = if attach {
                self.attach_validator(target_id, validator)
            } else {
                self.detach_validator(target_id, &name)
            };
            if !changed {
                continue;
            }
            debug!(%driver, %target, validator = %name, attach, "conditional rule applied");
            self.validate_upward(target_id);
        }
    }
}

impl fmt::Debug for FormEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormEngine")
            .field("status", &self.root_status())
            .field("nodes", &self.tree.node_ids().len())
            .field("rules", &self.rules.len())
            .field("listeners", &self.listeners.len())
            .field("sources", &self.sources.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::schema::{ArraySchema, ControlSchema, GroupSchema, RecordSchema};
    use reform_core::validation::{
        DeferredCheck, FieldsMatch, MinLength, Normalization, Pattern, Required,
    };
    use serde_json::json;
    use std::sync::Mutex;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn taken() -> AsyncOutcome {
        Ok(ValidationResult::Invalid(
            ValidationError::new("uniqueUsername", "taken").with_param("isTaken", true),
        ))
    }

    fn username_form(check: &DeferredCheck) -> GroupSchema {
        GroupSchema::new().child(
            "username",
            ControlSchema::new(json!(""))
                .validator(Required::new())
                .async_validator_debounced(check.clone(), ms(300)),
        )
    }

    fn engine(schema: impl Into<NodeSchema>, clock: &ManualClock) -> FormEngine {
        FormEngine::builder(schema)
            .clock(clock.clone())
            .build()
            .unwrap()
    }

    // -- sync validation and aggregation --

    #[test]
    fn sync_errors_make_control_and_root_invalid() {
        let clock = ManualClock::new();
        let mut form = engine(
            GroupSchema::new()
                .child("firstName", ControlSchema::new(json!("ma9net")).validator(MinLength::new(4)))
                .child("lastName", ControlSchema::new(json!("Hadi"))),
            &clock,
        );
        assert_eq!(form.root_status(), ControlStatus::Valid);

        form.set_value("firstName", "ab").unwrap();
        assert_eq!(form.status("firstName").unwrap(), ControlStatus::Invalid);
        assert_eq!(form.status("lastName").unwrap(), ControlStatus::Valid);
        assert_eq!(form.root_status(), ControlStatus::Invalid);
        let error = form.error("firstName", "minlength").unwrap();
        assert_eq!(error.param("requiredLength"), Some(&json!(4)));
        assert!(form.is_dirty("firstName").unwrap());
        assert!(!form.is_dirty("lastName").unwrap());
    }

    #[test]
    fn earlier_validator_keeps_shared_kind() {
        let clock = ManualClock::new();
        let mut form = engine(
            GroupSchema::new().child(
                "code",
                ControlSchema::new(json!("x"))
                    .validator(Pattern::full_match("[0-9]+").unwrap())
                    .validator(Pattern::full_match("[a-z]{3}").unwrap()),
            ),
            &clock,
        );
        let error = form.error("code", "pattern").unwrap();
        assert_eq!(error.param("requiredPattern"), Some(&json!("^(?:[0-9]+)$")));
        form.set_value("code", "12").unwrap();
        assert!(form.has_error("code", "pattern"));
    }

    #[test]
    fn cross_field_error_lands_on_group() {
        let clock = ManualClock::new();
        let mut form = engine(
            GroupSchema::new().child(
                "password",
                GroupSchema::new()
                    .child("password", ControlSchema::new(json!("secret1")))
                    .child("confirmPassword", ControlSchema::new(json!("secret1")))
                    .validator(FieldsMatch::new("password", "confirmPassword")),
            ),
            &clock,
        );
        assert_eq!(form.root_status(), ControlStatus::Valid);

        form.set_value("password.confirmPassword", "secret2").unwrap();
        assert!(form.has_error("password", "fieldsMatch"));
        assert!(form.errors("password.password").unwrap().is_empty());
        assert!(form.errors("password.confirmPassword").unwrap().is_empty());
        assert_eq!(form.status("password").unwrap(), ControlStatus::Invalid);
    }

    // -- update policies --

    #[test]
    fn blur_policy_holds_value_until_blur() {
        let clock = ManualClock::new();
        let mut form = engine(
            GroupSchema::new().child(
                "username",
                ControlSchema::new(json!(""))
                    .update_on(UpdateOn::Blur)
                    .validator(Required::new()),
            ),
            &clock,
        );
        form.set_value("username", "ma9net").unwrap();
        assert_eq!(form.value("username").unwrap(), json!(""));
        assert_eq!(form.pending_input("username").unwrap(), Some(json!("ma9net")));
        assert!(form.has_error("username", "required"));

        form.blur("username").unwrap();
        assert_eq!(form.value("username").unwrap(), json!("ma9net"));
        assert!(form.is_touched("username").unwrap());
        assert_eq!(form.root_status(), ControlStatus::Valid);
    }

    #[test]
    fn forced_write_bypasses_policy() {
        let clock = ManualClock::new();
        let mut form = engine(
            GroupSchema::new().child(
                "note",
                ControlSchema::new(json!("")).update_on(UpdateOn::Submit),
            ),
            &clock,
        );
        form.set_value_with("note", "now", SetValueOptions::programmatic())
            .unwrap();
        assert_eq!(form.value("note").unwrap(), json!("now"));
        assert!(!form.is_dirty("note").unwrap());
        assert!(matches!(
            form.pending_input(""),
            Err(FormError::NotAControl { .. })
        ));
    }

    // -- async protocol --

    #[test]
    fn debounce_issues_only_the_last_value() {
        let clock = ManualClock::new();
        let check = DeferredCheck::new("uniqueUsername");
        let mut form = engine(username_form(&check), &clock);

        form.set_value("username", "m").unwrap();
        assert_eq!(form.status("username").unwrap(), ControlStatus::Pending);
        clock.set(ms(50));
        form.set_value("username", "ma").unwrap();
        clock.set(ms(80));
        form.set_value("username", "ma9").unwrap();

        clock.set(ms(300));
        assert_eq!(form.tick().issued, 0);
        assert_eq!(form.next_deadline(), Some(ms(80)));

        clock.set(ms(380));
        assert_eq!(form.tick().issued, 1);
        let requests = check.take_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].value, json!("ma9"));
        assert_eq!(form.status("username").unwrap(), ControlStatus::Pending);

        requests.into_iter().for_each(|r| r.resolve(Ok(ValidationResult::Valid)));
        let report = form.tick();
        assert_eq!(report.applied, 1);
        assert_eq!(form.status("username").unwrap(), ControlStatus::Valid);
        assert!(form.is_idle());
    }

    #[test]
    fn superseded_result_is_discarded() {
        let clock = ManualClock::new();
        let check = DeferredCheck::new("uniqueUsername");
        let mut form = engine(
            GroupSchema::new().child(
                "username",
                ControlSchema::new(json!("")).async_validator_debounced(check.clone(), Duration::ZERO),
            ),
            &clock,
        );
        form.tick();
        let _initial = check.take_requests();

        form.set_value("username", "first").unwrap();
        form.tick();
        let first = check.take_requests().pop().unwrap();

        clock.set(ms(100));
        form.set_value("username", "second").unwrap();
        form.tick();
        let second = check.take_requests().pop().unwrap();

        clock.set(ms(150));
        second.resolve(Ok(ValidationResult::Valid));
        assert_eq!(form.tick().applied, 1);

        clock.set(ms(500));
        first.resolve(taken());
        let report = form.tick();
        assert_eq!(report.stale_discarded, 1);
        assert_eq!(form.status("username").unwrap(), ControlStatus::Valid);
        assert!(form.errors("username").unwrap().is_empty());
        let trace = form.async_trace("username", "uniqueUsername").unwrap().unwrap();
        assert!(trace.count("stale_discarded") >= 1);
    }

    #[test]
    fn async_error_merges_under_its_kind() {
        let clock = ManualClock::new();
        let check = DeferredCheck::new("uniqueUsername");
        let mut form = engine(username_form(&check), &clock);

        form.set_value("username", "ma9net").unwrap();
        clock.advance(ms(300));
        form.tick();
        check.take_requests().pop().unwrap().resolve(taken());
        form.tick();

        assert_eq!(form.status("username").unwrap(), ControlStatus::Invalid);
        let error = form.error("username", "uniqueUsername").unwrap();
        assert_eq!(error.param("isTaken"), Some(&json!(true)));
        assert_eq!(form.root_status(), ControlStatus::Invalid);
    }

    #[test]
    fn sync_error_suppresses_async() {
        let clock = ManualClock::new();
        let check = DeferredCheck::new("uniqueUsername");
        let mut form = engine(username_form(&check), &clock);

        // Empty value fails `required`, so nothing is scheduled.
        assert_eq!(form.status("username").unwrap(), ControlStatus::Invalid);
        assert!(form.is_idle());
        clock.advance(ms(1000));
        assert_eq!(form.tick().issued, 0);
        assert_eq!(check.pending(), 0);
    }

    #[test]
    fn duplicate_input_reuses_previous_result() {
        let clock = ManualClock::new();
        let check = DeferredCheck::new("uniqueUsername").with_normalization(Normalization::CaseInsensitive);
        let mut form = engine(username_form(&check), &clock);

        form.set_value("username", "hadi").unwrap();
        clock.advance(ms(300));
        form.tick();
        check.take_requests().pop().unwrap().resolve(taken());
        form.tick();

        form.set_value("username", " HADI ").unwrap();
        assert_eq!(form.status("username").unwrap(), ControlStatus::Pending);
        clock.advance(ms(300));
        let report = form.tick();
        assert_eq!(report.reused, 1);
        assert_eq!(report.issued, 0);
        assert_eq!(check.pending(), 0);
        assert!(form.has_error("username", "uniqueUsername"));
    }

    #[test]
    fn infrastructure_failure_is_reported_separately() {
        let clock = ManualClock::new();
        let check = DeferredCheck::new("uniqueUsername");
        let mut form = engine(username_form(&check), &clock);

        form.set_value("username", "ma9net").unwrap();
        clock.advance(ms(300));
        form.tick();
        check
            .take_requests()
            .pop()
            .unwrap()
            .resolve(Err(InfrastructureError::new("connection reset")));
        let report = form.tick();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, FormPath::parse("username"));
        assert_eq!(report.failures[0].validator, "uniqueUsername");
        assert_eq!(form.status("username").unwrap(), ControlStatus::Valid);
        assert!(!form.has_error("username", "uniqueUsername"));
        let state = form.state("username").unwrap();
        assert_eq!(state.async_failures["uniqueUsername"], "connection reset");

        // The failed input was not cached, so the retry issues again.
        form.revalidate("username").unwrap();
        clock.advance(ms(300));
        assert_eq!(form.tick().issued, 1);
        assert!(form.async_failure("username", "uniqueUsername").unwrap().is_none());
    }

    #[test]
    fn failed_check_blocks_submit_until_retried() {
        let clock = ManualClock::new();
        let check = DeferredCheck::new("uniqueUsername");
        let mut form = engine(username_form(&check), &clock);

        form.set_value("username", "x").unwrap();
        clock.advance(ms(300));
        form.tick();
        check
            .take_requests()
            .pop()
            .unwrap()
            .resolve(Err(InfrastructureError::new("503")));
        assert_eq!(form.tick().failures.len(), 1);
        assert_eq!(form.root_status(), ControlStatus::Valid);

        assert_eq!(
            form.submit(),
            SubmitOutcome::Unverified(vec![FormPath::parse("username")])
        );
        assert!(form.last_submitted().is_none());
        assert_eq!(form.value("username").unwrap(), json!("x"));

        form.revalidate("username").unwrap();
        clock.advance(ms(300));
        form.tick();
        check
            .take_requests()
            .pop()
            .unwrap()
            .resolve(Ok(ValidationResult::Valid));
        form.tick();
        assert!(form.unverified_paths().is_empty());
        assert!(matches!(form.submit(), SubmitOutcome::Submitted(_)));
    }

    #[test]
    fn removing_async_validator_cancels_its_work() {
        let clock = ManualClock::new();
        let check = DeferredCheck::new("uniqueUsername");
        let mut form = engine(username_form(&check), &clock);

        form.set_value("username", "ma9net").unwrap();
        clock.advance(ms(300));
        form.tick();
        let request = check.take_requests().pop().unwrap();

        assert!(form.remove_async_validator("username", "uniqueUsername").unwrap());
        assert_eq!(form.status("username").unwrap(), ControlStatus::Valid);
        request.resolve(taken());
        let report = form.tick();
        assert_eq!(report.stale_discarded, 1);
        assert_eq!(form.status("username").unwrap(), ControlStatus::Valid);
        assert!(!form.remove_async_validator("username", "uniqueUsername").unwrap());
    }

    // -- settlement --

    #[test]
    fn settlement_fires_once_per_pending_exit() {
        let clock = ManualClock::new();
        let check = DeferredCheck::new("uniqueUsername");
        let mut form = engine(username_form(&check), &clock);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        form.subscribe_settled(move |s| sink.lock().unwrap().push(s));

        form.set_value("username", "hadi").unwrap();
        clock.advance(ms(300));
        form.tick();
        form.tick();
        check.take_requests().pop().unwrap().resolve(Ok(ValidationResult::Valid));
        let report = form.tick();
        form.tick();

        assert_eq!(report.settled.len(), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Settled {
                from: ControlStatus::Pending,
                to: ControlStatus::Valid
            }]
        );
    }

    // -- structure --

    #[test]
    fn array_insert_and_remove_preserve_siblings() {
        let clock = ManualClock::new();
        let phone = GroupSchema::new()
            .child("label", ControlSchema::new(json!("Main")))
            .child("phone", ControlSchema::new(json!("")));
        let mut form = engine(
            GroupSchema::new().child("phones", ArraySchema::new().template(phone.clone()).item(phone)),
            &clock,
        );
        form.set_value("phones.0.phone", "555").unwrap();
        form.mark_touched("phones.0.phone").unwrap();

        let path = form.insert_item("phones", 0).unwrap();
        assert_eq!(path, FormPath::parse("phones.0"));
        assert_eq!(
            form.value("phones").unwrap(),
            json!([{"label": "Main", "phone": ""}, {"label": "Main", "phone": "555"}])
        );
        assert!(form.is_dirty("phones.1.phone").unwrap());
        assert!(form.is_touched("phones.1.phone").unwrap());

        form.remove_item("phones", 0).unwrap();
        assert_eq!(form.value("phones.0.phone").unwrap(), json!("555"));
        assert!(matches!(
            form.remove_item("phones", 4),
            Err(FormError::IndexOutOfBounds { index: 4, len: 1, .. })
        ));
    }

    #[test]
    fn structural_errors() {
        let clock = ManualClock::new();
        let mut form = engine(
            GroupSchema::new()
                .child("name", ControlSchema::new(json!("")))
                .child("skills", RecordSchema::new()),
            &clock,
        );
        assert!(matches!(form.value("ghost"), Err(FormError::NotFound { .. })));
        assert!(matches!(
            form.add_child("", "name", ControlSchema::new(json!(1))),
            Err(FormError::DuplicateKey { .. })
        ));
        assert!(matches!(form.remove_child("", "ghost"), Err(FormError::NoSuchChild { .. })));
        assert!(matches!(form.push_item("name"), Err(FormError::NotAComposite { .. })));
        assert!(matches!(form.push_item("skills"), Err(FormError::WrongKind { .. })));
        assert!(matches!(
            form.apply_field_keys("skills", ["rust"]),
            Err(FormError::NoTemplate { .. })
        ));
    }

    #[test]
    fn disabled_control_leaves_value_and_status() {
        let clock = ManualClock::new();
        let mut form = engine(
            GroupSchema::new()
                .child("a", ControlSchema::new(json!("")).validator(Required::new()))
                .child("b", ControlSchema::new(json!("ok"))),
            &clock,
        );
        assert_eq!(form.root_status(), ControlStatus::Invalid);
        form.disable("a").unwrap();
        assert_eq!(form.status("a").unwrap(), ControlStatus::Disabled);
        assert!(form.errors("a").unwrap().is_empty());
        assert_eq!(form.root_status(), ControlStatus::Valid);
        assert_eq!(form.form_value(), json!({"b": "ok"}));
        assert_eq!(form.raw_value("").unwrap(), json!({"a": "", "b": "ok"}));

        form.enable("a").unwrap();
        assert_eq!(form.root_status(), ControlStatus::Invalid);
    }

    // -- listeners --

    #[test]
    fn value_listener_sees_descendant_writes() {
        let clock = ManualClock::new();
        let mut form = engine(
            GroupSchema::new().child(
                "address",
                GroupSchema::new().child("city", ControlSchema::new(json!(""))),
            ),
            &clock,
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = form
            .subscribe_value_changes("address", move |path, value| {
                sink.lock().unwrap().push((path.to_string(), value.clone()));
            })
            .unwrap();

        form.set_value("address.city", "Kyiv").unwrap();
        let silent = SetValueOptions {
            emit_event: false,
            ..SetValueOptions::default()
        };
        form.set_value_with("address.city", "Lviv", silent).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("address".to_string(), json!({"city": "Kyiv"}))]
        );

        assert!(form.unsubscribe(id));
        form.set_value("address.city", "Odesa").unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    // -- snapshots --

    #[test]
    fn reset_restores_values_and_clears_flags() {
        let clock = ManualClock::new();
        let mut form = engine(
            GroupSchema::new()
                .child("firstName", ControlSchema::new(json!("ma9net")).validator(MinLength::new(4)))
                .child("email", ControlSchema::new(json!("Hadi@ma9net.com"))),
            &clock,
        );
        let snapshot = form.snapshot();
        form.set_value("firstName", "ab").unwrap();
        form.mark_touched("email").unwrap();

        form.reset_to(&snapshot);
        assert_eq!(form.form_value(), snapshot.value().clone());
        assert!(!form.is_dirty("firstName").unwrap());
        assert!(!form.is_touched("email").unwrap());
        assert_eq!(form.root_status(), ControlStatus::Valid);
    }

    #[test]
    fn reset_ignores_unknown_and_keeps_unmentioned_paths() {
        let clock = ManualClock::new();
        let mut form = engine(
            GroupSchema::new()
                .child("a", ControlSchema::new(json!(1)))
                .child("b", ControlSchema::new(json!(2))),
            &clock,
        );
        form.set_value("b", 20).unwrap();
        form.reset_to(&Snapshot::from_value(json!({"a": 10, "zzz": {"deep": true}})));
        assert_eq!(form.form_value(), json!({"a": 10, "b": 20}));
    }

    #[test]
    fn submit_checkpoints_and_reset_returns_there() {
        let clock = ManualClock::new();
        let mut form = engine(
            GroupSchema::new().child("name", ControlSchema::new(json!("ma9net")).validator(Required::new())),
            &clock,
        );
        form.set_value("name", "").unwrap();
        assert_eq!(form.submit(), SubmitOutcome::Blocked(ControlStatus::Invalid));

        form.set_value("name", "hadi").unwrap();
        let SubmitOutcome::Submitted(snapshot) = form.submit() else {
            panic!("valid form should submit");
        };
        assert_eq!(snapshot.value(), &json!({"name": "hadi"}));
        assert!(!form.is_dirty("name").unwrap());

        form.set_value("name", "other").unwrap();
        form.reset();
        assert_eq!(form.value("name").unwrap(), json!("hadi"));
        assert_eq!(form.initial_snapshot().value(), &json!({"name": "ma9net"}));
    }

    #[test]
    fn submit_commits_held_inputs() {
        let clock = ManualClock::new();
        let mut form = engine(
            GroupSchema::new().child(
                "comment",
                ControlSchema::new(json!("")).update_on(UpdateOn::Submit),
            ),
            &clock,
        );
        form.set_value("comment", "hello").unwrap();
        form.blur("comment").unwrap();
        assert_eq!(form.value("comment").unwrap(), json!(""));
        assert!(matches!(form.submit(), SubmitOutcome::Submitted(_)));
        assert_eq!(form.last_submitted().unwrap().value(), &json!({"comment": "hello"}));
    }

    // -- dynamic fields --

    #[test]
    fn field_keys_add_only_unseen_entries() {
        let clock = ManualClock::new();
        let check = DeferredCheck::new("uniqueUsername");
        let mut form = engine(
            username_form(&check)
                .child("nickname", ControlSchema::new(json!("")).validator(Required::new()))
                .child(
                    "skills",
                    RecordSchema::new()
                        .template(ControlSchema::new(json!(false)))
                        .entry("angular", ControlSchema::new(json!(false))),
                ),
            &clock,
        );
        form.set_value("skills.angular", true).unwrap();
        form.mark_touched("skills.angular").unwrap();
        form.blur("nickname").unwrap();
        form.set_value("username", "hadi").unwrap();
        let watched = ["skills.angular", "nickname", "username"];
        let before: Vec<_> = watched.iter().map(|p| form.state(*p).unwrap()).collect();
        assert_eq!(before[1].status, ControlStatus::Invalid);
        assert_eq!(before[2].status, ControlStatus::Pending);

        let added = form.apply_field_keys("skills", ["angular", "rxjs", "rust", "rxjs"]).unwrap();
        assert_eq!(added, vec![FormPath::parse("skills.rxjs"), FormPath::parse("skills.rust")]);
        assert_eq!(
            form.value("skills").unwrap(),
            json!({"angular": true, "rxjs": false, "rust": false})
        );
        for state in before {
            assert_eq!(form.state(state.path.clone()).unwrap(), state);
        }
        assert_eq!(form.root_status(), ControlStatus::Pending);
        assert_eq!(form.initial_snapshot().value()["skills"]["rust"], json!(false));
        assert_eq!(form.tick().fields_added.len(), 2);

        // The debounce window of the pending sibling was not restarted.
        clock.advance(ms(300));
        assert_eq!(form.tick().issued, 1);
    }

    // -- conditional rules --

    fn passport_form(year: i64) -> FormEngine {
        FormEngine::builder(
            GroupSchema::new()
                .child("yearOfBirth", ControlSchema::new(json!(year)))
                .child("passport", ControlSchema::new(json!("")).validator(Required::new())),
        )
        .clock(ManualClock::new())
        .rule(ConditionalRule::new(
            "yearOfBirth",
            crate::conditional::min_age_gate(18, 2026),
            "passport",
            Required::new(),
        ))
        .build()
        .unwrap()
    }

    #[test]
    fn rule_false_at_build_removes_schema_validator() {
        let mut form = passport_form(2020);
        assert!(form.validator_names("passport").unwrap().is_empty());
        assert!(!form.has_error("passport", "required"));
        assert_eq!(form.root_status(), ControlStatus::Valid);

        form.set_value("yearOfBirth", 1990).unwrap();
        assert!(form.has_error("passport", "required"));
        form.set_value("yearOfBirth", 2015).unwrap();
        assert!(!form.has_error("passport", "required"));
    }

    #[test]
    fn rule_true_at_build_keeps_single_validator() {
        let form = passport_form(1990);
        assert_eq!(form.validator_names("passport").unwrap(), vec!["required".to_string()]);
        assert!(form.has_error("passport", "required"));
    }

    #[test]
    fn rule_reattaches_to_rebuilt_target() {
        let phone = GroupSchema::new().child("phone", ControlSchema::new(json!("")));
        let mut form = FormEngine::builder(
            GroupSchema::new()
                .child("yearOfBirth", ControlSchema::new(json!(1990)))
                .child(
                    "phones",
                    ArraySchema::new().template(phone.clone()).item(phone),
                ),
        )
        .clock(ManualClock::new())
        .rule(ConditionalRule::new(
            "yearOfBirth",
            crate::conditional::min_age_gate(18, 2026),
            "phones.0.phone",
            Required::new(),
        ))
        .build()
        .unwrap();
        assert!(form.has_error("phones.0.phone", "required"));

        form.remove_item("phones", 0).unwrap();
        assert_eq!(form.root_status(), ControlStatus::Valid);
        form.push_item("phones").unwrap();
        assert_eq!(
            form.validator_names("phones.0.phone").unwrap(),
            vec!["required".to_string()]
        );
        assert!(form.has_error("phones.0.phone", "required"));
        assert_eq!(form.root_status(), ControlStatus::Invalid);
    }
}
