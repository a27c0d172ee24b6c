//! Test helpers for integration tests
//!
//! Provides utilities for managing the kind cluster and NodeSet resources.

use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Config, CustomResourceExt};
use tokio::sync::OnceCell;
use tokio::time::sleep;

use nodeset::crd::{NodeSet, NodeSetSpec};
use nodeset::INSTANCE_LABEL;

/// Name of the kind cluster used for integration tests
pub const TEST_CLUSTER_NAME: &str = "nodeset-integration-test";

/// Namespace every integration test works in
pub const TEST_NAMESPACE: &str = "nodeset-it";

/// Global lock to ensure cluster is created only once
static CLUSTER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Track if CRD and namespace have been installed (async-safe)
static CRD_INSTALLED: OnceCell<Result<(), String>> = OnceCell::const_new();

/// Check if a kind cluster with the given name exists
pub fn kind_cluster_exists(name: &str) -> bool {
    let output = Command::new("kind")
        .args(["get", "clusters"])
        .output()
        .expect("failed to run kind");

    let clusters = String::from_utf8_lossy(&output.stdout);
    clusters.lines().any(|line| line.trim() == name)
}

/// Create a kind cluster for testing
pub fn create_kind_cluster(name: &str) -> Result<(), String> {
    if kind_cluster_exists(name) {
        println!("Kind cluster '{name}' already exists, reusing it");
        return Ok(());
    }

    println!("Creating kind cluster '{name}'...");
    let output = Command::new("kind")
        .args(["create", "cluster", "--name", name, "--wait", "60s"])
        .output()
        .map_err(|e| format!("failed to run kind: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "failed to create kind cluster: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    println!("Kind cluster '{name}' created successfully");
    Ok(())
}

/// Install the NodeSet CRD and the test namespace
pub async fn install_crd(client: &Client) -> Result<(), kube::Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("nodeset-integration-test").force();

    println!("Installing NodeSet CRD...");
    crds.patch(
        "nodesets.nodeset.dev",
        &params,
        &Patch::Apply(&NodeSet::crd()),
    )
    .await?;

    let namespaces: Api<Namespace> = Api::all(client.clone());
    let ns = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": TEST_NAMESPACE }
    });
    namespaces
        .patch(TEST_NAMESPACE, &params, &Patch::Apply(&ns))
        .await?;

    // Wait for CRD to be established
    sleep(Duration::from_secs(2)).await;

    println!("CRD installed successfully");
    Ok(())
}

/// Create a Kubernetes client connected to the test cluster
pub async fn create_test_client() -> Result<Client, String> {
    // Use the kind cluster context directly without modifying kubeconfig
    let context_name = format!("kind-{TEST_CLUSTER_NAME}");

    let config = Config::from_kubeconfig(&kube::config::KubeConfigOptions {
        context: Some(context_name),
        ..Default::default()
    })
    .await
    .map_err(|e| format!("failed to load kubeconfig: {e}"))?;

    Client::try_from(config).map_err(|e| format!("failed to create client: {e}"))
}

/// Ensure the test cluster is ready (thread-safe, cluster created once)
///
/// Returns a fresh Client for each call - clients should not be shared across test threads.
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let cluster_result = CLUSTER_INIT.get_or_init(|| create_kind_cluster(TEST_CLUSTER_NAME));
    cluster_result.clone()?;

    let client = create_test_client().await?;

    let crd_result = CRD_INSTALLED
        .get_or_init(|| async {
            let client = create_test_client().await?;
            install_crd(&client)
                .await
                .map_err(|e| format!("failed to install CRD: {e}"))
        })
        .await;

    crd_result.clone()?;

    Ok(client)
}

/// Build a NodeSet in the test namespace
pub fn sample_nodeset(name: &str, replicas: u32) -> NodeSet {
    NodeSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: NodeSetSpec {
            replicas,
            image: "busybox:1.36".to_string(),
            command: vec!["sleep".to_string(), "3600".to_string()],
        },
        status: None,
    }
}

/// Create a NodeSet and return the stored object
pub async fn create_nodeset(client: &Client, nodeset: &NodeSet) -> NodeSet {
    let api: Api<NodeSet> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    api.create(&PostParams::default(), nodeset)
        .await
        .expect("failed to create NodeSet")
}

/// Delete a NodeSet and every pod carrying its instance label
pub async fn cleanup_nodeset(client: &Client, name: &str) {
    let api: Api<NodeSet> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let _ = api.delete(name, &DeleteParams::default()).await;

    let pods: Api<Pod> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let selector = format!("{INSTANCE_LABEL}={name}");
    let _ = pods
        .delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels(&selector),
        )
        .await;

    // Wait for deletion to complete
    sleep(Duration::from_millis(500)).await;
}

/// Pods of `name` that are not being deleted
pub async fn live_pods(client: &Client, name: &str) -> Vec<Pod> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let selector = format!("{INSTANCE_LABEL}={name}");
    pods.list(&ListParams::default().labels(&selector))
        .await
        .expect("failed to list pods")
        .items
        .into_iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .collect()
}

/// Names of all nodes in the cluster
pub async fn node_names(client: &Client) -> Vec<String> {
    let nodes: Api<k8s_openapi::api::core::v1::Node> = Api::all(client.clone());
    nodes
        .list(&ListParams::default())
        .await
        .expect("failed to list nodes")
        .items
        .into_iter()
        .filter_map(|n| n.metadata.name)
        .collect()
}
