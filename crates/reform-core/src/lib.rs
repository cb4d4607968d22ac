#![forbid(unsafe_code)]

//! Reform core: the vocabulary shared by the control-tree runtime.
//!
//! - [`path`] addresses nodes (`"address.city"`, `"phones.0.phone"`)
//! - [`validation`] holds the sync and async validator contracts, the
//!   built-in validators, and the async sequencing machinery
//!
//! The crate owns no tree and no clock; `reform-runtime` builds the engine on
//! top of it.

pub mod path;
pub mod validation;

pub use path::{FormPath, PathSegment};
