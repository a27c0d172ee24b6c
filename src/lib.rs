//! NodeSet - per-node replica controller for Kubernetes
//!
//! A NodeSet asks for `replicas` copies of a single-container pod on every
//! node of the cluster. The controller watches NodeSets and the pods they
//! own, and on every pass levels each node to the desired count, reporting
//! the aggregate in the NodeSet's status.
//!
//! # Modules
//!
//! - [`crd`] - The NodeSet Custom Resource Definition
//! - [`controller`] - Reconciliation logic and the cluster API seam
//! - [`comparator`] - Pure per-node comparison of desired vs observed pods
//! - [`workload`] - Pod construction and label conventions
//! - [`config`] - Reconciler tunables
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod comparator;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Labels and Identity
// =============================================================================

/// Label carrying the name of the NodeSet a pod belongs to
pub const INSTANCE_LABEL: &str = "nodeset.dev/instance";

/// Label carrying the name of the node a pod was created for
pub const NODE_LABEL: &str = "nodeset.dev/node";

/// Standard Kubernetes label for the managing tool
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on pods created by this controller
pub const MANAGED_BY: &str = "nodeset-controller";

/// Field manager name used for every write
pub const FIELD_MANAGER: &str = "nodeset-controller";
