//! Controller implementations for the NodeSet CRD
//!
//! Reconciliation follows the Kubernetes observe-diff-act loop: every pass
//! re-reads the cluster, compares it per node, and corrects one step at a time.

mod in_flight;
mod nodeset;

pub use in_flight::{InFlight, InFlightGuard};
pub use nodeset::{
    error_policy, instance_key, reconcile, Context, ContextBuilder, KubeClient, KubeClientImpl,
};
