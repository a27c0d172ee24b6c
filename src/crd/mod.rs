//! Custom Resource Definitions for the NodeSet controller

mod nodeset;
mod types;

pub use nodeset::{NodeSet, NodeSetSpec, NodeSetStatus, MAX_REPLICAS};
pub use types::NodeSetPhase;
