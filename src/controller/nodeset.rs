//! NodeSet controller implementation
//!
//! One reconciliation pass re-reads the NodeSet and the cluster, compares
//! every node's pod population with `spec.replicas`, issues at most one
//! corrective step per node, and writes the aggregated status back when it
//! changed. Nothing is cached between passes; a failed pass leaves whatever
//! it already did in place and the next pass re-derives the truth.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use rand::Rng;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::in_flight::InFlight;
use crate::comparator::{compare, Correction, PodRecord};
use crate::config::ControllerConfig;
use crate::crd::{NodeSet, NodeSetStatus};
use crate::workload::{build_pod, pod_selector};
use crate::{Error, FIELD_MANAGER};

/// Trait abstracting the cluster API calls made by a reconciliation pass
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a NodeSet, returning `None` if it no longer exists
    async fn get_nodeset(&self, namespace: &str, name: &str) -> Result<Option<NodeSet>, Error>;

    /// Names of all nodes in the cluster, in listing order
    async fn list_nodes(&self) -> Result<Vec<String>, Error>;

    /// Pods labelled as belonging to `instance` on `node`, in listing order
    async fn list_pods(
        &self,
        namespace: &str,
        instance: &str,
        node: &str,
    ) -> Result<Vec<PodRecord>, Error>;

    /// Create a pod and return the name the API server assigned to it
    async fn create_pod(&self, pod: &Pod) -> Result<String, Error>;

    /// Delete a pod; a pod that is already gone is not an error
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Replace the status of a NodeSet
    ///
    /// The write is conditional on `nodeset`'s resourceVersion; losing the
    /// race yields [`Error::Conflict`]. Returns the updated object so a later
    /// write in the same pass carries the fresh resourceVersion.
    async fn update_status(
        &self,
        nodeset: &NodeSet,
        status: &NodeSetStatus,
    ) -> Result<NodeSet, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_nodeset(&self, namespace: &str, name: &str) -> Result<Option<NodeSet>, Error> {
        let api: Api<NodeSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_nodes(&self) -> Result<Vec<String>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;

        Ok(nodes
            .items
            .into_iter()
            .filter_map(|node| node.metadata.name)
            .collect())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        instance: &str,
        node: &str,
    ) -> Result<Vec<PodRecord>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&pod_selector(instance, node));
        let pods = api.list(&params).await?;

        Ok(pods.items.iter().filter_map(PodRecord::from_pod).collect())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<String, Error> {
        let namespace = pod
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::missing_field("Pod", "metadata.namespace"))?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let created = api.create(&params, pod).await?;

        created
            .metadata
            .name
            .ok_or_else(|| Error::missing_field("Pod", "metadata.name"))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        match api.delete(name, &DeleteParams::default()).await.map_err(Error::from) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(pod = %name, "pod already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn update_status(
        &self,
        nodeset: &NodeSet,
        status: &NodeSetStatus,
    ) -> Result<NodeSet, Error> {
        let name = nodeset.name_any();
        let namespace = nodeset
            .namespace()
            .ok_or_else(|| Error::missing_field("NodeSet", "metadata.namespace"))?;
        let api: Api<NodeSet> = Api::namespaced(self.client.clone(), &namespace);

        // Every field is spelled out so that unset options become explicit
        // nulls and clear what the previous status held.
        let mut patch = serde_json::json!({
            "status": {
                "availableReplicas": status.available_replicas,
                "podNames": status.pod_names,
                "phase": status.phase,
                "busySince": status.busy_since,
            }
        });
        if let Some(rv) = nodeset.resource_version() {
            patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
        }

        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match api.patch_status(&name, &params, &Patch::Merge(&patch)).await {
            Ok(updated) => Ok(updated),
            Err(kube::Error::Api(resp)) if resp.code == 409 => Err(Error::Conflict {
                name: format!("{namespace}/{name}"),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// Controller context containing shared state and clients
///
/// The context is shared across all reconciliation calls. Passes for
/// different NodeSets run concurrently against it; the only per-instance
/// state it holds is the in-flight set and the failure counters.
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .config(ControllerConfig::default())
///     .build();
/// ```
pub struct Context {
    /// Cluster API client (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Reconciler tunables
    pub config: ControllerConfig,
    /// NodeSets with a pass currently running in this process
    pub in_flight: InFlight,
    /// Consecutive failed passes per NodeSet key
    failures: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Record a failed pass for `key` and return the consecutive count
    fn record_failure(&self, key: &str) -> u32 {
        let mut count = self.failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Forget the failure history of `key` after a successful pass
    fn record_success(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Create a context for testing with a custom mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, config: ControllerConfig) -> Self {
        Self {
            kube,
            config,
            in_flight: InFlight::new(),
            failures: DashMap::new(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            config: ControllerConfig::default(),
        }
    }

    /// Set the reconciler configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: Arc::new(KubeClientImpl::new(self.client)),
            config: self.config,
            in_flight: InFlight::new(),
            failures: DashMap::new(),
        }
    }
}

/// `namespace/name` key identifying a NodeSet
pub fn instance_key(nodeset: &NodeSet) -> String {
    format!(
        "{}/{}",
        nodeset.namespace().unwrap_or_default(),
        nodeset.name_any()
    )
}

/// Reconcile a NodeSet resource
///
/// The triggering object only supplies the instance key; desired state and
/// status are re-read through the [`KubeClient`] so the Busy check never
/// acts on a stale cache entry.
///
/// Returns `Action::await_change()` when the NodeSet is gone or its spec is
/// invalid, and a timed requeue otherwise. Any API error aborts the pass and
/// is returned to the caller.
#[instrument(skip(nodeset, ctx), fields(nodeset = %nodeset.name_any(), namespace = ?nodeset.namespace()))]
pub async fn reconcile(nodeset: Arc<NodeSet>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = nodeset.name_any();
    let namespace = nodeset
        .namespace()
        .ok_or_else(|| Error::missing_field("NodeSet", "metadata.namespace"))?;
    let key = instance_key(&nodeset);

    let Some(_guard) = ctx.in_flight.try_acquire(&key) else {
        debug!("another pass for this NodeSet is still running");
        return Ok(Action::requeue(ctx.config.busy_retry_interval));
    };

    let started = Instant::now();
    let result = run_pass(&namespace, &name, &ctx).await;

    if result.is_ok() {
        ctx.record_success(&key);
    }
    debug!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok = result.is_ok(),
        "pass finished"
    );
    result
}

/// One reconciliation pass for the NodeSet `namespace/name`
async fn run_pass(namespace: &str, name: &str, ctx: &Context) -> Result<Action, Error> {
    let Some(nodeset) = ctx.kube.get_nodeset(namespace, name).await? else {
        debug!("NodeSet no longer exists");
        return Ok(Action::await_change());
    };

    if let Err(e) = nodeset.spec.validate() {
        warn!(error = %e, "NodeSet spec is invalid, waiting for a change");
        return Ok(Action::await_change());
    }

    let previous = nodeset.status.clone().unwrap_or_default();
    let now = Utc::now();

    if previous.is_busy() {
        if !busy_is_stale(&previous, ctx.config.stale_busy_after, now) {
            info!("corrective actions still settling, retrying later");
            return Ok(Action::requeue(ctx.config.busy_retry_interval));
        }
        warn!(
            busy_since = previous.busy_since.as_deref().unwrap_or_default(),
            "Busy flag outlived its grace period, assuming an interrupted pass"
        );
    }

    let replicas = nodeset.spec.replicas;
    let nodes = ctx.kube.list_nodes().await?;
    debug!(nodes = nodes.len(), replicas, "comparing nodes");

    let mut current = nodeset;
    let mut marked_busy = false;
    let mut pod_names = Vec::new();

    for node in &nodes {
        let pods = ctx.kube.list_pods(namespace, name, node).await?;
        let comparison = compare(replicas, &pods, ctx.config.scale_down);

        let mut created = Vec::new();
        if comparison.correction.is_action() {
            if !marked_busy {
                info!("drift detected, marking NodeSet Busy");
                current = ctx
                    .kube
                    .update_status(&current, &previous.busy_at(now))
                    .await?;
                marked_busy = true;
            }

            info!(
                node = %node,
                live = comparison.live.len(),
                replicas,
                delta = comparison.delta(replicas),
                "correcting node"
            );
            created = apply_correction(&current, node, &comparison.correction, ctx).await?;
        }

        pod_names.extend(comparison.settled_names(&created));
    }

    let observed = NodeSetStatus::idle(pod_names);

    if observed.counts_differ(&previous) || marked_busy || previous.is_busy() {
        info!(
            available = observed.available_replicas,
            previous = previous.available_replicas,
            "updating NodeSet status"
        );
        ctx.kube.update_status(&current, &observed).await?;
    } else {
        debug!(
            available = observed.available_replicas,
            "status unchanged, skipping update"
        );
    }

    Ok(Action::requeue(ctx.config.requeue_interval))
}

/// Carry out one node's correction and return the names of created pods
async fn apply_correction(
    nodeset: &NodeSet,
    node: &str,
    correction: &Correction,
    ctx: &Context,
) -> Result<Vec<String>, Error> {
    match correction {
        Correction::None => Ok(Vec::new()),
        Correction::Create(count) => {
            let pod = build_pod(nodeset, node)?;
            let mut created = Vec::new();
            for _ in 0..*count {
                let pod_name = ctx.kube.create_pod(&pod).await?;
                info!(node = %node, pod = %pod_name, "created pod");
                created.push(pod_name);
            }
            Ok(created)
        }
        Correction::Delete(victims) => {
            let namespace = nodeset
                .namespace()
                .ok_or_else(|| Error::missing_field("NodeSet", "metadata.namespace"))?;
            for victim in victims {
                ctx.kube.delete_pod(&namespace, victim).await?;
                info!(node = %node, pod = %victim, "deleted pod");
            }
            Ok(Vec::new())
        }
    }
}

/// Returns true if a Busy status is old enough to be treated as abandoned
///
/// A Busy status without a timestamp (written by an older controller) is
/// never considered stale.
fn busy_is_stale(status: &NodeSetStatus, grace: Duration, now: DateTime<Utc>) -> bool {
    status
        .busy_since()
        .and_then(|since| (now - since).to_std().ok())
        .map(|age| age > grace)
        .unwrap_or(false)
}

/// Error policy for the controller
///
/// Requeues with exponential backoff per NodeSet: the delay doubles with
/// every consecutive failure up to the configured cap, with 0.5x-1.5x jitter
/// so that many failing instances do not retry in lockstep.
pub fn error_policy(nodeset: Arc<NodeSet>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = instance_key(&nodeset);
    let failures = ctx.record_failure(&key);
    let delay = jittered(ctx.config.error_backoff(failures));

    if error.is_conflict() {
        warn!(
            nodeset = %key,
            failures,
            retry_ms = delay.as_millis() as u64,
            "status write lost a race, retrying"
        );
    } else {
        error!(
            ?error,
            nodeset = %key,
            failures,
            retry_ms = delay.as_millis() as u64,
            "reconciliation failed"
        );
    }

    Action::requeue(delay)
}

fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}
