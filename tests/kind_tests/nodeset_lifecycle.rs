//! Integration tests for NodeSet reconciliation
//!
//! These tests drive `reconcile` directly against a real API server, one pass
//! at a time, so each story can assert on the state between passes.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::Client;

use nodeset::config::ControllerConfig;
use nodeset::controller::{reconcile, Context};
use nodeset::crd::{NodeSet, NodeSetPhase, NodeSetStatus};
use nodeset::NODE_LABEL;

use super::helpers::{
    cleanup_nodeset, create_nodeset, ensure_test_cluster, live_pods, node_names, sample_nodeset,
    TEST_NAMESPACE,
};

fn create_test_context(client: Client) -> Arc<Context> {
    Arc::new(Context::builder(client).config(ControllerConfig::default()).build())
}

async fn run_pass(client: &Client, nodeset: &NodeSet) -> Action {
    reconcile(Arc::new(nodeset.clone()), create_test_context(client.clone()))
        .await
        .expect("reconcile should succeed")
}

async fn current_status(client: &Client, name: &str) -> NodeSetStatus {
    let api: Api<NodeSet> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    api.get(name)
        .await
        .expect("failed to get NodeSet")
        .status
        .unwrap_or_default()
}

/// Story: A new NodeSet gets its pods on every node in one pass
///
/// Expected behavior:
/// - `replicas` pods per node exist after the first pass
/// - Every pod carries the node label of the node it was created for
/// - Status lists every created pod and ends Idle
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_new_nodeset_is_levelled_on_every_node() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let name = "life-scale-up";
    cleanup_nodeset(&client, name).await;
    let nodeset = create_nodeset(&client, &sample_nodeset(name, 2)).await;
    let nodes = node_names(&client).await;

    let action = run_pass(&client, &nodeset).await;

    assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    let pods = live_pods(&client, name).await;
    assert_eq!(pods.len(), 2 * nodes.len());
    for node in &nodes {
        let on_node = pods
            .iter()
            .filter(|p| {
                p.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(NODE_LABEL))
                    == Some(node)
            })
            .count();
        assert_eq!(on_node, 2, "node {node} should run two pods");
    }

    let status = current_status(&client, name).await;
    assert_eq!(status.available_replicas as usize, pods.len());
    assert_eq!(status.phase, Some(NodeSetPhase::Idle));
    assert!(status.busy_since.is_none());

    // A second pass finds nothing to do
    run_pass(&client, &nodeset).await;
    assert_eq!(live_pods(&client, name).await.len(), 2 * nodes.len());

    cleanup_nodeset(&client, name).await;
}

/// Story: Scaling down removes one pod per node per pass
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_scale_down_is_gradual() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<NodeSet> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "life-scale-down";
    cleanup_nodeset(&client, name).await;
    let nodeset = create_nodeset(&client, &sample_nodeset(name, 3)).await;
    let nodes = node_names(&client).await.len();
    run_pass(&client, &nodeset).await;

    let patch = serde_json::json!({ "spec": { "replicas": 1 } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .expect("failed to scale down");

    run_pass(&client, &nodeset).await;
    assert_eq!(live_pods(&client, name).await.len(), 2 * nodes);

    run_pass(&client, &nodeset).await;
    assert_eq!(live_pods(&client, name).await.len(), nodes);
    assert_eq!(
        current_status(&client, name).await.available_replicas as usize,
        nodes
    );

    cleanup_nodeset(&client, name).await;
}

/// Story: A NodeSet left Busy by a pass still in flight is not touched
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_busy_nodeset_is_not_reconciled() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<NodeSet> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "life-busy";
    cleanup_nodeset(&client, name).await;
    let nodeset = create_nodeset(&client, &sample_nodeset(name, 1)).await;

    let busy = NodeSetStatus::default().busy_at(chrono::Utc::now());
    let patch = serde_json::json!({ "status": busy });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .expect("failed to mark Busy");

    let action = run_pass(&client, &nodeset).await;

    assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    assert!(live_pods(&client, name).await.is_empty());

    cleanup_nodeset(&client, name).await;
}

/// Story: Reconciling a NodeSet that was already deleted is a no-op
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_deleted_nodeset_is_ignored() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let name = "life-deleted";
    cleanup_nodeset(&client, name).await;

    let action = run_pass(&client, &sample_nodeset(name, 1)).await;

    assert_eq!(action, Action::await_change());
    assert!(live_pods(&client, name).await.is_empty());
}
