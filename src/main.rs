//! NodeSet controller - keeps a fixed number of pods on every node

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nodeset::comparator::ScaleDownPolicy;
use nodeset::config::{
    ControllerConfig, DEFAULT_BUSY_RETRY_SECS, DEFAULT_ERROR_BACKOFF_MAX_SECS,
    DEFAULT_ERROR_BACKOFF_SECS, DEFAULT_REQUEUE_SECS, DEFAULT_STALE_BUSY_SECS,
};
use nodeset::controller::{error_policy, reconcile, Context};
use nodeset::crd::NodeSet;
use nodeset::FIELD_MANAGER;

/// NodeSet - run a fixed number of pods on every node of the cluster
#[derive(Parser, Debug)]
#[command(name = "nodeset", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "NODESET_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Installs or updates the NodeSet CRD, then watches NodeSets and the
    /// pods they own until SIGINT or SIGTERM.
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug, Clone)]
struct ControllerArgs {
    /// Only watch NodeSets in this namespace (default: all namespaces)
    #[arg(long, env = "NODESET_NAMESPACE")]
    namespace: Option<String>,

    /// Seconds between passes once a NodeSet is levelled
    #[arg(long, env = "NODESET_REQUEUE_SECS", default_value_t = DEFAULT_REQUEUE_SECS)]
    requeue_secs: u64,

    /// Seconds to wait before retrying a Busy NodeSet
    #[arg(long, env = "NODESET_BUSY_RETRY_SECS", default_value_t = DEFAULT_BUSY_RETRY_SECS)]
    busy_retry_secs: u64,

    /// Age in seconds after which a Busy flag is treated as abandoned
    #[arg(long, env = "NODESET_STALE_BUSY_SECS", default_value_t = DEFAULT_STALE_BUSY_SECS)]
    stale_busy_secs: u64,

    /// How many excess pods a pass may delete per node
    #[arg(long, env = "NODESET_SCALE_DOWN", default_value_t = ScaleDownPolicy::OnePerPass)]
    scale_down: ScaleDownPolicy,

    /// First retry delay in seconds after a failed pass
    #[arg(
        long,
        env = "NODESET_ERROR_BACKOFF_SECS",
        default_value_t = DEFAULT_ERROR_BACKOFF_SECS
    )]
    error_backoff_secs: u64,

    /// Maximum retry delay in seconds after repeated failures
    #[arg(
        long,
        env = "NODESET_ERROR_BACKOFF_MAX_SECS",
        default_value_t = DEFAULT_ERROR_BACKOFF_MAX_SECS
    )]
    error_backoff_max_secs: u64,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self {
            namespace: None,
            requeue_secs: DEFAULT_REQUEUE_SECS,
            busy_retry_secs: DEFAULT_BUSY_RETRY_SECS,
            stale_busy_secs: DEFAULT_STALE_BUSY_SECS,
            scale_down: ScaleDownPolicy::OnePerPass,
            error_backoff_secs: DEFAULT_ERROR_BACKOFF_SECS,
            error_backoff_max_secs: DEFAULT_ERROR_BACKOFF_MAX_SECS,
        }
    }
}

impl ControllerArgs {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            requeue_interval: Duration::from_secs(self.requeue_secs),
            busy_retry_interval: Duration::from_secs(self.busy_retry_secs),
            stale_busy_after: Duration::from_secs(self.stale_busy_secs),
            scale_down: self.scale_down,
            error_backoff_base: Duration::from_secs(self.error_backoff_secs),
            error_backoff_max: Duration::from_secs(self.error_backoff_max_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_json);

    if cli.crd {
        let crd = serde_yaml::to_string(&NodeSet::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::default()).await,
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the default filter.
fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nodeset=debug,kube=info,tower=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();
}

/// Ensure the NodeSet CRD is installed
///
/// The controller installs its own CRD on startup using server-side apply.
/// This ensures the CRD version always matches the controller version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing NodeSet CRD...");
    crds.patch(
        "nodesets.nodeset.dev",
        &params,
        &Patch::Apply(&NodeSet::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install NodeSet CRD: {}", e))?;

    tracing::info!("NodeSet CRD installed/updated");
    Ok(())
}

/// Run in controller mode
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("NodeSet controller starting...");

    let config = args.controller_config();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid controller configuration: {}", e))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let (nodesets, pods): (Api<NodeSet>, Api<Pod>) = match args.namespace.as_deref() {
        Some(ns) => {
            tracing::info!(namespace = %ns, "Watching a single namespace");
            (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
            )
        }
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    tracing::info!(
        requeue_secs = args.requeue_secs,
        busy_retry_secs = args.busy_retry_secs,
        stale_busy_secs = args.stale_busy_secs,
        scale_down = %args.scale_down,
        "Starting NodeSet controller"
    );

    let ctx = Arc::new(Context::builder(client).config(config).build());

    Controller::new(nodesets, WatcherConfig::default())
        .owns(pods, WatcherConfig::default().labels(nodeset::INSTANCE_LABEL))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result)
        .await;

    tracing::info!("NodeSet controller shutting down");
    Ok(())
}

async fn log_reconcile_result<E: std::fmt::Debug>(
    result: Result<(ObjectRef<NodeSet>, Action), E>,
) {
    match result {
        Ok((obj, action)) => {
            tracing::debug!(nodeset = %obj, ?action, "NodeSet reconciliation completed");
        }
        Err(e) => {
            tracing::error!(error = ?e, "NodeSet reconciliation error");
        }
    }
}
