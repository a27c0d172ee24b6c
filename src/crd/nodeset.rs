//! NodeSet Custom Resource Definition
//!
//! A NodeSet declares how many copies of a single-container pod should run on
//! *every* node of the cluster. The controller keeps each node's live pod
//! count equal to `spec.replicas` and reports the aggregate in the status.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::NodeSetPhase;

/// Upper bound on `spec.replicas`
pub const MAX_REPLICAS: u32 = 1000;

/// Specification for a NodeSet
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "nodeset.dev",
    version = "v1alpha1",
    kind = "NodeSet",
    plural = "nodesets",
    shortname = "nset",
    status = "NodeSetStatus",
    namespaced,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetSpec {
    /// Desired pod count on each node
    #[schemars(range(max = 1000))]
    pub replicas: u32,

    /// Container image run by every pod
    pub image: String,

    /// Entry point and arguments; empty means the image default
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

impl NodeSetSpec {
    /// Validate the specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.replicas > MAX_REPLICAS {
            return Err(crate::Error::validation(format!(
                "spec.replicas must be at most {MAX_REPLICAS}, got {}",
                self.replicas
            )));
        }

        if self.image.trim().is_empty() {
            return Err(crate::Error::validation("spec.image must not be empty"));
        }

        if let Some(pos) = self.command.iter().position(|arg| arg.is_empty()) {
            return Err(crate::Error::validation(format!(
                "spec.command[{pos}] must not be empty"
            )));
        }

        Ok(())
    }
}

/// Status for a NodeSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetStatus {
    /// Live pods summed over all nodes
    #[serde(default)]
    pub available_replicas: u32,

    /// Names of the live pods, node by node in listing order
    #[serde(default)]
    pub pod_names: Vec<String>,

    /// Reconciliation phase; unset until the first pass writes status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<NodeSetPhase>,

    /// RFC 3339 time at which the phase last became Busy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busy_since: Option<String>,
}

impl NodeSetStatus {
    /// Create an Idle status carrying the given live pod names
    pub fn idle(pod_names: Vec<String>) -> Self {
        Self {
            available_replicas: pod_names.len() as u32,
            pod_names,
            phase: Some(NodeSetPhase::Idle),
            busy_since: None,
        }
    }

    /// Return a copy of this status marked Busy as of `now`
    pub fn busy_at(&self, now: DateTime<Utc>) -> Self {
        Self {
            phase: Some(NodeSetPhase::Busy),
            busy_since: Some(now.to_rfc3339()),
            ..self.clone()
        }
    }

    /// Returns true if the persisted phase is Busy
    pub fn is_busy(&self) -> bool {
        self.phase.map(|p| p.is_busy()).unwrap_or(false)
    }

    /// Parsed `busy_since`, if present and well-formed
    pub fn busy_since(&self) -> Option<DateTime<Utc>> {
        self.busy_since
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Returns true if the observed counts differ from `other`
    ///
    /// Only the replica count and the pod-name list take part; the phase is
    /// bookkeeping and never forces a write on its own.
    pub fn counts_differ(&self, other: &NodeSetStatus) -> bool {
        self.available_replicas != other.available_replicas || self.pod_names != other.pod_names
    }
}
