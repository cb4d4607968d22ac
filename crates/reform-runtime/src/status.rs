#![forbid(unsafe_code)]

//! Control status and its aggregation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Validation status of a node.
///
/// # Invariants
///
/// - `Pending` iff an async evaluation is scheduled or outstanding on the
///   node or an enabled descendant.
/// - `Invalid` iff the node (or an enabled descendant) carries errors and
///   nothing is pending.
/// - `Disabled` overrides everything and is skipped by parent aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlStatus {
    Valid,
    Invalid,
    Pending,
    Disabled,
}

impl ControlStatus {
    #[must_use]
    pub fn is_valid(self) -> bool {
        self == Self::Valid
    }

    #[must_use]
    pub fn is_pending(self) -> bool {
        self == Self::Pending
    }

    #[must_use]
    pub fn is_disabled(self) -> bool {
        self == Self::Disabled
    }

    /// Ordering used for worst-case aggregation. `Disabled` never wins.
    fn severity(self) -> u8 {
        match self {
            Self::Disabled => 0,
            Self::Valid => 1,
            Self::Invalid => 2,
            Self::Pending => 3,
        }
    }

    /// The worse of two statuses.
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for ControlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Valid => "VALID",
            Self::Invalid => "INVALID",
            Self::Pending => "PENDING",
            Self::Disabled => "DISABLED",
        })
    }
}

/// Worst status over the enabled entries, `Valid` when there are none.
pub fn aggregate(statuses: impl IntoIterator<Item = ControlStatus>) -> ControlStatus {
    statuses
        .into_iter()
        .filter(|s| !s.is_disabled())
        .fold(ControlStatus::Valid, ControlStatus::worst)
}

/// Emitted when the root leaves `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settled {
    pub from: ControlStatus,
    pub to: ControlStatus,
}

/// Two-state look-back over the root status.
///
/// Fed the root status at every decision point; yields a [`Settled`] exactly
/// once per `Pending -> other` edge.
#[derive(Debug, Clone)]
pub struct SettlementDetector {
    previous: ControlStatus,
}

impl SettlementDetector {
    #[must_use]
    pub fn new(initial: ControlStatus) -> Self {
        Self { previous: initial }
    }

    pub fn observe(&mut self, current: ControlStatus) -> Option<Settled> {
        let previous = std::mem::replace(&mut self.previous, current);
        (previous == ControlStatus::Pending && current != ControlStatus::Pending).then_some(
            Settled {
                from: previous,
                to: current,
            },
        )
    }

    #[must_use]
    pub fn previous(&self) -> ControlStatus {
        self.previous
    }
}
