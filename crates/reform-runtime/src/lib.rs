#![forbid(unsafe_code)]

//! Reform Runtime
//!
//! A reactive control tree for forms: values and validators live on nodes,
//! statuses propagate from leaves to the root, and async validators run
//! behind a debounce window with stale results discarded.
//!
//! # Key Components
//!
//! - [`FormEngine`] - Owns the tree; every mutation and every async merge goes through it
//! - [`NodeSchema`] - Declarative shape of a form ([`ControlSchema`], [`GroupSchema`], [`ArraySchema`], [`RecordSchema`])
//! - [`ControlStatus`] - `VALID`, `INVALID`, `PENDING`, `DISABLED`
//! - [`ConditionalRule`] - Attach a validator to one field depending on another's value
//! - [`FieldKeySource`] - Background provider of record keys (dynamic fields)
//! - [`Snapshot`] - Serializable checkpoint of the whole form value
//! - [`Clock`] - Time source; [`ManualClock`] drives deterministic tests
//!
//! # How it fits in the system
//!
//! `reform-core` supplies paths, validators and the async sequencing
//! machinery. This crate wires them into a tree, owns time and threads, and
//! exposes the operations a view layer binds to. The host calls
//! [`FormEngine::tick`] from its event loop (or after
//! [`FormEngine::next_deadline`]) to release debounced checks and merge their
//! results.

pub mod clock;
pub mod conditional;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod events;
pub mod provider;
pub mod schema;
pub mod snapshot;
pub mod status;
mod tree;

pub use clock::{Clock, ManualClock, SystemClock};
pub use conditional::{ConditionalRule, min_age_gate};
pub use config::EngineConfig;
pub use engine::{FormEngine, FormEngineBuilder, NodeState, SetValueOptions, SubmitOutcome};
pub use error::{FormError, FormResult};
pub use events::{SubId, TickReport, ValidationInfrastructureError};
pub use provider::{FieldKeySender, FieldKeySource, StaticFieldKeys, StopSignal};
pub use schema::{
    ArraySchema, AsyncSpec, ControlSchema, GroupSchema, NodeSchema, RecordSchema, UpdateOn,
};
pub use snapshot::Snapshot;
pub use status::{ControlStatus, Settled, SettlementDetector};
pub use tree::{NodeId, NodeKindTag};

pub use reform_core::path::{FormPath, PathSegment};
