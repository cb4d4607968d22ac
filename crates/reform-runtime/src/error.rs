#![forbid(unsafe_code)]

//! Structural errors.
//!
//! Validation failures are data stored on nodes, and async transport
//! failures travel through [`TickReport`](crate::TickReport). What remains
//! are programming errors against the tree shape, which fail fast.

use reform_core::path::FormPath;
use thiserror::Error;

use crate::tree::NodeKindTag;

/// A structural operation addressed the tree incorrectly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormError {
    #[error("no node at path `{path}`")]
    NotFound { path: FormPath },

    #[error("`{parent}` already has a child named `{key}`")]
    DuplicateKey { parent: FormPath, key: String },

    #[error("`{parent}` has no child `{segment}`")]
    NoSuchChild { parent: FormPath, segment: String },

    #[error("`{path}` is a control and has no children")]
    NotAComposite { path: FormPath },

    #[error("`{path}` is a composite, expected a control")]
    NotAControl { path: FormPath },

    #[error("`{path}` has no item template")]
    NoTemplate { path: FormPath },

    #[error("index {index} out of bounds for `{path}` (len {len})")]
    IndexOutOfBounds {
        path: FormPath,
        index: usize,
        len: usize,
    },

    #[error("`{path}`: expected {expected}, found {actual}")]
    WrongKind {
        path: FormPath,
        expected: NodeKindTag,
        actual: NodeKindTag,
    },
}

/// Result alias for structural operations.
pub type FormResult<T> = Result<T, FormError>;
