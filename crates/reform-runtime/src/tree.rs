#![forbid(unsafe_code)]

//! Arena-backed control tree.
//!
//! Nodes live in a map keyed by [`NodeId`]; composites own their children by
//! id and every node keeps a non-owning parent id for upward propagation.
//! Ids are never reused, so a completion or listener that outlives its node
//! simply fails to resolve.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use reform_core::path::{FormPath, PathSegment};
use reform_core::validation::{
    AsyncValidationCoordinator, ErrorMap, FieldLookup, InfrastructureError,
    SharedAsyncValidator, SharedValidator, ValidationError, ValidationTrace,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::debounce::DebounceTimer;
use crate::error::{FormError, FormResult};
use crate::schema::{Bindings, NodeSchema, UpdateOn};
use crate::status::{ControlStatus, aggregate};

/// Stable identity of a node for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of one async validator attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BindingId(u64);

/// The shape of a node, without its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKindTag {
    Control,
    Group,
    Array,
    Record,
}

impl fmt::Display for NodeKindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Control => "control",
            Self::Group => "group",
            Self::Array => "array",
            Self::Record => "record",
        })
    }
}

/// An async validator attached to a node, with its debounce timer and
/// sequencing state.
pub(crate) struct AsyncBinding {
    pub(crate) id: BindingId,
    pub(crate) validator: SharedAsyncValidator,
    pub(crate) timer: DebounceTimer,
    pub(crate) coordinator: AsyncValidationCoordinator,
    /// Error from the last applied evaluation.
    pub(crate) result: Option<ValidationError>,
    /// Transport failure of the last evaluation, cleared by the next attempt.
    pub(crate) failure: Option<InfrastructureError>,
}

impl AsyncBinding {
    /// Scheduled or issued and not yet resolved.
    pub(crate) fn is_pending(&self) -> bool {
        self.timer.is_armed() || self.coordinator.has_in_flight()
    }

    /// Drop the scheduled value and orphan the in-flight evaluation.
    pub(crate) fn cancel(&mut self, now: Duration) {
        self.timer.disarm();
        self.coordinator.cancel(now);
    }

    pub(crate) fn name(&self) -> &str {
        self.validator.name()
    }
}

impl fmt::Debug for AsyncBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncBinding")
            .field("id", &self.id)
            .field("validator", &self.name())
            .field("timer", &self.timer)
            .field("result", &self.result)
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) enum NodeKind {
    Control {
        value: Value,
        pending_input: Option<Value>,
        update_on: UpdateOn,
    },
    Group {
        children: Vec<(String, NodeId)>,
    },
    Array {
        items: Vec<NodeId>,
        template: Option<Box<NodeSchema>>,
    },
    Record {
        entries: Vec<(String, NodeId)>,
        template: Option<Box<NodeSchema>>,
    },
}

impl NodeKind {
    pub(crate) fn tag(&self) -> NodeKindTag {
        match self {
            Self::Control { .. } => NodeKindTag::Control,
            Self::Group { .. } => NodeKindTag::Group,
            Self::Array { .. } => NodeKindTag::Array,
            Self::Record { .. } => NodeKindTag::Record,
        }
    }

    fn child_ids(&self) -> Vec<NodeId> {
        match self {
            Self::Control { .. } => Vec::new(),
            Self::Group { children } => children.iter().map(|(_, id)| *id).collect(),
            Self::Record { entries, .. } => entries.iter().map(|(_, id)| *id).collect(),
            Self::Array { items, .. } => items.clone(),
        }
    }

    fn child(&self, segment: &PathSegment) -> Option<NodeId> {
        match self {
            Self::Control { .. } => None,
            Self::Group { children: keyed } | Self::Record { entries: keyed, .. } => {
                let key = segment.as_key();
                keyed.iter().find(|(k, _)| *k == key).map(|(_, id)| *id)
            }
            Self::Array { items, .. } => segment.as_index().and_then(|i| items.get(i).copied()),
        }
    }

    fn segment_of(&self, child: NodeId) -> Option<PathSegment> {
        match self {
            Self::Control { .. } => None,
            Self::Group { children: keyed } | Self::Record { entries: keyed, .. } => keyed
                .iter()
                .find(|(_, id)| *id == child)
                .map(|(k, _)| PathSegment::Key(k.clone())),
            Self::Array { items, .. } => items
                .iter()
                .position(|id| *id == child)
                .map(PathSegment::Index),
        }
    }
}

pub(crate) struct Node {
    pub(crate) parent: Option<NodeId>,
    pub(crate) kind: NodeKind,
    pub(crate) status: ControlStatus,
    /// Output of the sync validators on the last validation pass.
    pub(crate) sync_errors: ErrorMap,
    /// Published errors: sync errors, or async results once settled.
    pub(crate) errors: ErrorMap,
    pub(crate) dirty: bool,
    pub(crate) touched: bool,
    pub(crate) disabled: bool,
    pub(crate) validators: Vec<SharedValidator>,
    pub(crate) bindings: Vec<AsyncBinding>,
}

impl Node {
    pub(crate) fn own_pending(&self) -> bool {
        self.bindings.iter().any(AsyncBinding::is_pending)
    }

    /// Recompute `errors` and `status` from this node's own state and the
    /// aggregate of its children.
    fn recompute(&mut self, children: ControlStatus) {
        if self.disabled {
            self.errors.clear();
            self.status = ControlStatus::Disabled;
            return;
        }
        let pending = self.own_pending();
        let mut errors = self.sync_errors.clone();
        if !pending && errors.is_empty() {
            for binding in &self.bindings {
                if let Some(error) = &binding.result {
                    errors.insert_first_wins(error.clone());
                }
            }
        }
        self.status = if pending || children == ControlStatus::Pending {
            ControlStatus::Pending
        } else if !errors.is_empty() || children == ControlStatus::Invalid {
            ControlStatus::Invalid
        } else {
            ControlStatus::Valid
        };
        self.errors = errors;
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let validators: Vec<&str> = self.validators.iter().map(|v| v.name()).collect();
        f.debug_struct("Node")
            .field("parent", &self.parent)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("errors", &self.errors)
            .field("dirty", &self.dirty)
            .field("touched", &self.touched)
            .field("disabled", &self.disabled)
            .field("validators", &validators)
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

/// The node arena.
#[derive(Debug)]
pub(crate) struct FormTree {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
    next_node: u64,
    next_binding: u64,
    default_debounce: Duration,
    trace_capacity: usize,
}

impl FormTree {
    pub(crate) fn new(schema: &NodeSchema, default_debounce: Duration, trace_capacity: usize) -> Self {
        let mut tree = Self {
            nodes: HashMap::new(),
            root: NodeId(0),
            next_node: 0,
            next_binding: 0,
            default_debounce,
            trace_capacity,
        };
        tree.root = tree.instantiate(schema, None);
        tree
    }

    // -- structure --

    /// Build `schema` as a detached subtree under `parent` and return its id.
    /// The caller links it into the parent's child list.
    pub(crate) fn instantiate(&mut self, schema: &NodeSchema, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;

        let kind = match schema {
            NodeSchema::Control(s) => NodeKind::Control {
                value: s.initial.clone(),
                pending_input: None,
                update_on: s.update_on,
            },
            NodeSchema::Group(s) => NodeKind::Group {
                children: s
                    .children
                    .iter()
                    .map(|(k, c)| (k.clone(), self.instantiate(c, Some(id))))
                    .collect(),
            },
            NodeSchema::Array(s) => NodeKind::Array {
                items: s.items.iter().map(|c| self.instantiate(c, Some(id))).collect(),
                template: s.template.clone(),
            },
            NodeSchema::Record(s) => NodeKind::Record {
                entries: s
                    .entries
                    .iter()
                    .map(|(k, c)| (k.clone(), self.instantiate(c, Some(id))))
                    .collect(),
                template: s.template.clone(),
            },
        };

        let Bindings {
            validators,
            async_validators,
            disabled,
        } = schema.bindings();
        let bindings = async_validators
            .iter()
            .map(|spec| self.make_binding(spec.validator.clone(), spec.debounce))
            .collect();

        self.nodes.insert(
            id,
            Node {
                parent,
                kind,
                status: if *disabled {
                    ControlStatus::Disabled
                } else {
                    ControlStatus::Valid
                },
                sync_errors: ErrorMap::new(),
                errors: ErrorMap::new(),
                dirty: false,
                touched: false,
                disabled: *disabled,
                validators: validators.clone(),
                bindings,
            },
        );
        id
    }

    pub(crate) fn make_binding(
        &mut self,
        validator: SharedAsyncValidator,
        debounce: Option<Duration>,
    ) -> AsyncBinding {
        let id = BindingId(self.next_binding);
        self.next_binding += 1;
        AsyncBinding {
            id,
            validator,
            timer: DebounceTimer::new(debounce.unwrap_or(self.default_debounce)),
            coordinator: AsyncValidationCoordinator::with_trace(ValidationTrace::with_capacity(
                self.trace_capacity,
            )),
            result: None,
            failure: None,
        }
    }

    /// Link a new keyed child under a group or record.
    pub(crate) fn add_keyed(
        &mut self,
        parent: NodeId,
        key: &str,
        schema: &NodeSchema,
    ) -> FormResult<NodeId> {
        let parent_path = self.path_of(parent).unwrap_or_default();
        let node = self.node(parent).ok_or_else(|| FormError::NotFound {
            path: parent_path.clone(),
        })?;
        match &node.kind {
            NodeKind::Group { children: keyed } | NodeKind::Record { entries: keyed, .. } => {
                if keyed.iter().any(|(k, _)| k == key) {
                    return Err(FormError::DuplicateKey {
                        parent: parent_path,
                        key: key.to_string(),
                    });
                }
            }
            NodeKind::Control { .. } => {
                return Err(FormError::NotAComposite { path: parent_path });
            }
            NodeKind::Array { .. } => {
                return Err(FormError::WrongKind {
                    path: parent_path,
                    expected: NodeKindTag::Group,
                    actual: NodeKindTag::Array,
                });
            }
        }

        let child = self.instantiate(schema, Some(parent));
        if let Some(Node {
            kind: NodeKind::Group { children: keyed } | NodeKind::Record { entries: keyed, .. },
            ..
        }) = self.nodes.get_mut(&parent)
        {
            keyed.push((key.to_string(), child));
        }
        Ok(child)
    }

    /// Insert a new item into an array at `index`, shifting later items.
    pub(crate) fn insert_item(
        &mut self,
        parent: NodeId,
        index: usize,
        schema: &NodeSchema,
    ) -> FormResult<NodeId> {
        let path = self.path_of(parent).unwrap_or_default();
        let len = self.array_len(parent, &path)?;
        if index > len {
            return Err(FormError::IndexOutOfBounds { path, index, len });
        }
        let child = self.instantiate(schema, Some(parent));
        if let Some(Node {
            kind: NodeKind::Array { items, .. },
            ..
        }) = self.nodes.get_mut(&parent)
        {
            items.insert(index, child);
        }
        Ok(child)
    }

    pub(crate) fn array_len(&self, id: NodeId, path: &FormPath) -> FormResult<usize> {
        let node = self.node(id).ok_or_else(|| FormError::NotFound { path: path.clone() })?;
        match &node.kind {
            NodeKind::Array { items, .. } => Ok(items.len()),
            NodeKind::Control { .. } => Err(FormError::NotAComposite { path: path.clone() }),
            other => Err(FormError::WrongKind {
                path: path.clone(),
                expected: NodeKindTag::Array,
                actual: other.tag(),
            }),
        }
    }

    /// Template for new items of an array or entries of a record.
    pub(crate) fn template(&self, id: NodeId) -> FormResult<NodeSchema> {
        let path = self.path_of(id).unwrap_or_default();
        let node = self.node(id).ok_or_else(|| FormError::NotFound { path: path.clone() })?;
        match &node.kind {
            NodeKind::Array { template, .. } | NodeKind::Record { template, .. } => template
                .as_deref()
                .cloned()
                .ok_or(FormError::NoTemplate { path }),
            NodeKind::Control { .. } => Err(FormError::NotAComposite { path }),
            NodeKind::Group { .. } => Err(FormError::NoTemplate { path }),
        }
    }

    /// Unlink and drop the child at `segment`, returning the dropped nodes.
    pub(crate) fn remove_child(
        &mut self,
        parent: NodeId,
        segment: &PathSegment,
    ) -> FormResult<Vec<Node>> {
        let parent_path = self.path_of(parent).unwrap_or_default();
        let node = self.nodes.get_mut(&parent).ok_or_else(|| FormError::NotFound {
            path: parent_path.clone(),
        })?;
        let removed = match &mut node.kind {
            NodeKind::Control { .. } => {
                return Err(FormError::NotAComposite { path: parent_path });
            }
            NodeKind::Group { children: keyed } | NodeKind::Record { entries: keyed, .. } => {
                let key = segment.as_key();
                keyed
                    .iter()
                    .position(|(k, _)| *k == key)
                    .map(|pos| keyed.remove(pos).1)
            }
            NodeKind::Array { items, .. } => {
                let len = items.len();
                match segment.as_index() {
                    Some(index) if index < len => Some(items.remove(index)),
                    Some(index) => {
                        return Err(FormError::IndexOutOfBounds {
                            path: parent_path,
                            index,
                            len,
                        });
                    }
                    None => None,
                }
            }
        };
        let child = removed.ok_or_else(|| FormError::NoSuchChild {
            parent: parent_path,
            segment: segment.to_string(),
        })?;

        let mut dropped = Vec::new();
        for id in self.subtree(child) {
            if let Some(node) = self.nodes.remove(&id) {
                dropped.push(node);
            }
        }
        Ok(dropped)
    }

    // -- navigation --

    pub(crate) fn root(&self) -> NodeId {
        self.root
    }

    pub(crate) fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub(crate) fn resolve(&self, path: &FormPath) -> FormResult<NodeId> {
        let mut current = self.root;
        for segment in path.segments() {
            current = self
                .node(current)
                .and_then(|node| node.kind.child(segment))
                .ok_or_else(|| FormError::NotFound { path: path.clone() })?;
        }
        Ok(current)
    }

    /// Path from the root to `id`, or `None` if the node is gone.
    pub(crate) fn path_of(&self, id: NodeId) -> Option<FormPath> {
        let mut segments = Vec::new();
        let mut current = id;
        while let Some(parent) = self.node(current)?.parent {
            segments.push(self.node(parent)?.kind.segment_of(current)?);
            current = parent;
        }
        segments.reverse();
        Some(FormPath::from_segments(segments))
    }

    pub(crate) fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id).map(|n| n.kind.child_ids()).unwrap_or_default()
    }

    /// Parent first, root last.
    pub(crate) fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.node(id).and_then(|n| n.parent);
        while let Some(parent) = current {
            out.push(parent);
            current = self.node(parent).and_then(|n| n.parent);
        }
        out
    }

    /// `id` and all its descendants, parents before children.
    pub(crate) fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !self.contains(current) {
                continue;
            }
            out.push(current);
            let mut children = self.children(current);
            children.reverse();
            stack.extend(children);
        }
        out
    }

    /// `id` and all its descendants, children before parents.
    pub(crate) fn subtree_post_order(&self, id: NodeId) -> Vec<NodeId> {
        let mut order = self.subtree(id);
        order.reverse();
        order
    }

    /// Every live node id in ascending order.
    pub(crate) fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    // -- values --

    /// Composed value, leaving out disabled descendants.
    pub(crate) fn value(&self, id: NodeId) -> Value {
        self.compose(id, false)
    }

    /// Composed value including disabled descendants.
    pub(crate) fn raw_value(&self, id: NodeId) -> Value {
        self.compose(id, true)
    }

    fn compose(&self, id: NodeId, include_disabled: bool) -> Value {
        let Some(node) = self.node(id) else {
            return Value::Null;
        };
        let keep = |child: &NodeId| {
            include_disabled || self.node(*child).is_some_and(|n| !n.disabled)
        };
        match &node.kind {
            NodeKind::Control { value, .. } => value.clone(),
            NodeKind::Group { children: keyed } | NodeKind::Record { entries: keyed, .. } => {
                let map: Map<String, Value> = keyed
                    .iter()
                    .filter(|(_, c)| keep(c))
                    .map(|(k, c)| (k.clone(), self.compose(*c, include_disabled)))
                    .collect();
                Value::Object(map)
            }
            NodeKind::Array { items, .. } => Value::Array(
                items
                    .iter()
                    .filter(|c| keep(*c))
                    .map(|c| self.compose(*c, include_disabled))
                    .collect(),
            ),
        }
    }

    /// Pair every control under `id` with the part of `value` addressed to
    /// it. Parts with no matching control are skipped.
    pub(crate) fn collect_writes(&self, id: NodeId, value: &Value, out: &mut Vec<(NodeId, Value)>) {
        let Some(node) = self.node(id) else {
            return;
        };
        match &node.kind {
            NodeKind::Control { .. } => out.push((id, value.clone())),
            NodeKind::Group { children: keyed } | NodeKind::Record { entries: keyed, .. } => {
                for (key, child) in keyed {
                    if let Some(part) = value.get(key.as_str()) {
                        self.collect_writes(*child, part, out);
                    }
                }
            }
            NodeKind::Array { items, .. } => {
                for (index, child) in items.iter().enumerate() {
                    if let Some(part) = value.get(index) {
                        self.collect_writes(*child, part, out);
                    }
                }
            }
        }
    }

    // -- status --

    /// Recompute the status of `id` from its own state and its children.
    pub(crate) fn refresh_status(&mut self, id: NodeId) {
        let children = aggregate(
            self.children(id)
                .iter()
                .filter_map(|c| self.node(*c))
                .map(|n| n.status),
        );
        if let Some(node) = self.nodes.get_mut(&id) {
            node.recompute(children);
        }
    }

    /// Refresh `id` and then every ancestor up to the root.
    pub(crate) fn refresh_upward(&mut self, id: NodeId) {
        self.refresh_status(id);
        for ancestor in self.ancestors(id) {
            self.refresh_status(ancestor);
        }
    }
}

impl FieldLookup for FormTree {
    fn value_at(&self, path: &FormPath) -> Option<Value> {
        self.resolve(path).ok().map(|id| self.value(id))
    }
}
