#![forbid(unsafe_code)]

//! Notifications out of the engine.
//!
//! Two delivery paths exist:
//!
//! - **Listeners** registered with the engine are called synchronously at
//!   the end of the operation that caused the change: settlement of the
//!   root, and value changes of a watched node.
//! - **[`TickReport`]s** accumulate everything that happened between two
//!   calls to [`FormEngine::tick`](crate::FormEngine::tick), including async
//!   infrastructure failures, which never touch node status.

use std::fmt;

use reform_core::path::FormPath;
use reform_core::validation::{InfrastructureError, ValidationToken};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::status::Settled;
use crate::tree::{FormTree, NodeId};

/// Identifies a listener for [`FormEngine::unsubscribe`](crate::FormEngine::unsubscribe).
pub type SubId = u64;

/// An async validator could not produce a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("async validator `{validator}` on `{path}` failed ({token}): {source}")]
pub struct ValidationInfrastructureError {
    pub path: FormPath,
    pub validator: String,
    pub token: ValidationToken,
    pub source: InfrastructureError,
}

/// What happened since the previous tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Async evaluations handed to their validators.
    pub issued: usize,
    /// Closed debounce windows answered from the previous result.
    pub reused: usize,
    /// Completions merged into node state.
    pub applied: usize,
    /// Completions dropped because a newer evaluation superseded them or
    /// their node or binding is gone.
    pub stale_discarded: usize,
    /// Transport failures, in arrival order.
    pub failures: Vec<ValidationInfrastructureError>,
    /// Controls created by field-key deliveries.
    pub fields_added: Vec<FormPath>,
    /// Root settlements observed.
    pub settled: Vec<Settled>,
}

impl TickReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

type SettledCallback = Box<dyn FnMut(Settled) + Send>;
type ValueCallback = Box<dyn FnMut(&FormPath, &Value) + Send>;

struct ValueListener {
    id: SubId,
    node: NodeId,
    last: Value,
    callback: ValueCallback,
}

/// Registered listeners.
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: SubId,
    settled: Vec<(SubId, SettledCallback)>,
    values: Vec<ValueListener>,
}

impl Listeners {
    fn allocate(&mut self) -> SubId {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn subscribe_settled(&mut self, callback: SettledCallback) -> SubId {
        let id = self.allocate();
        self.settled.push((id, callback));
        id
    }

    /// Watch `node`, starting from its `current` value.
    pub(crate) fn subscribe_value(
        &mut self,
        node: NodeId,
        current: Value,
        callback: ValueCallback,
    ) -> SubId {
        let id = self.allocate();
        self.values.push(ValueListener {
            id,
            node,
            last: current,
            callback,
        });
        id
    }

    pub(crate) fn unsubscribe(&mut self, id: SubId) -> bool {
        let before = self.settled.len() + self.values.len();
        self.settled.retain(|(sub, _)| *sub != id);
        self.values.retain(|l| l.id != id);
        before != self.settled.len() + self.values.len()
    }

    pub(crate) fn emit_settled(&mut self, settled: Settled) {
        for (_, callback) in &mut self.settled {
            callback(settled);
        }
    }

    /// Compare each watched node against the value last delivered and call
    /// the listener on a difference. With `emit` off, the new value is
    /// recorded silently. Listeners whose node is gone are dropped.
    pub(crate) fn notify_values(&mut self, tree: &FormTree, emit: bool) {
        self.values.retain_mut(|listener| {
            let Some(path) = tree.path_of(listener.node) else {
                debug!(sub_id = listener.id, "dropping value listener of removed node");
                return false;
            };
            let current = tree.value(listener.node);
            if current != listener.last {
                if emit {
                    (listener.callback)(&path, &current);
                }
                listener.last = current;
            }
            true
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.settled.len() + self.values.len()
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("settled", &self.settled.len())
            .field("values", &self.values.len())
            .finish()
    }
}
