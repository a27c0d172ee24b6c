//! Supporting types for the NodeSet CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reconciliation phase of a NodeSet
///
/// A closed two-state machine persisted in `status.phase`:
///
/// - `Idle -> Busy`: a pass is about to create or delete pods. Written before
///   the first corrective call of the pass.
/// - `Busy` at the start of a pass: corrective work from an earlier pass may
///   still be settling, so the pass only requeues.
/// - `Busy -> Idle`: written together with the aggregated counts once a pass
///   observes a change.
///
/// Older controllers wrote `Sleep` and `Running`; both still deserialize.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum NodeSetPhase {
    /// No corrective action is in flight
    #[serde(alias = "Sleep")]
    Idle,
    /// Corrective actions were issued and have not been confirmed yet
    #[serde(alias = "Running")]
    Busy,
}

impl NodeSetPhase {
    /// Returns true if corrective work may still be in flight
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

impl std::fmt::Display for NodeSetPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Busy => write!(f, "Busy"),
        }
    }
}
