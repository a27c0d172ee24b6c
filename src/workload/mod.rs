//! Pod construction for NodeSets
//!
//! Translates a NodeSet spec into a pod pinned to one node. Pod names are
//! generated by the API server from a `<nodeset>-` prefix so repeated passes
//! never collide.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    Pod, PodSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::NodeSet;
use crate::{Error, INSTANCE_LABEL, MANAGED_BY, MANAGED_BY_LABEL, NODE_LABEL};

/// Labels carried by every pod of `instance` on `node`
pub fn pod_labels(instance: &str, node: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (INSTANCE_LABEL.to_string(), instance.to_string()),
        (NODE_LABEL.to_string(), node.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ])
}

/// Label selector matching the pods of `instance` on `node`
pub fn pod_selector(instance: &str, node: &str) -> String {
    format!("{INSTANCE_LABEL}={instance},{NODE_LABEL}={node}")
}

/// Build a pod for `nodeset` pinned to `node`
///
/// The pod:
/// - gets a server-generated name with the NodeSet name as prefix
/// - lives in the NodeSet's namespace
/// - carries the instance and node labels used to list it back
/// - runs one container with the spec's image and command
/// - requires scheduling onto `node` through a `metadata.name` node affinity
/// - is controller-owned by the NodeSet, so deleting the NodeSet removes it
pub fn build_pod(nodeset: &NodeSet, node: &str) -> Result<Pod, Error> {
    let name = nodeset.name_any();
    let namespace = nodeset
        .namespace()
        .ok_or_else(|| Error::missing_field("NodeSet", "metadata.namespace"))?;
    let owner = nodeset
        .controller_owner_ref(&())
        .ok_or_else(|| Error::missing_field("NodeSet", "metadata.uid"))?;

    let command = (!nodeset.spec.command.is_empty()).then(|| nodeset.spec.command.clone());

    let container = Container {
        name: format!("{name}-container"),
        image: Some(nodeset.spec.image.clone()),
        command,
        ..Default::default()
    };

    Ok(Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{name}-")),
            namespace: Some(namespace),
            labels: Some(pod_labels(&name, node)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            affinity: Some(pin_to_node(node)),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Required node affinity on the node's `metadata.name` field
fn pin_to_node(node: &str) -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_fields: Some(vec![NodeSelectorRequirement {
                        key: "metadata.name".to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![node.to_string()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
