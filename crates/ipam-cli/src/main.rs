//! ipamd - dual-purpose binary: invoked with no subcommand it behaves as the
//! CNI attachment plugin (stdin JSON envelope, spec.md §6); `agent` runs the
//! long-lived node-slice and pod-cleanup controllers (C6/C7); `reconcile`
//! runs the one-shot batch reconciler (C8).

mod cni;

use clap::{Parser, Subcommand};
use ipam_controller::{BatchReconciler, ClusterClient, EventBus, NodeSliceStore, Orchestrator, PodCleanupController};
use ipam_storage::RedbBackend;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ipamd", about = "Cluster IP address management plugin and agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node-slice and pod-cleanup controllers for this node.
    Agent {
        /// Node this agent is running on (falls back to $NODENAME).
        #[arg(long, env = "NODENAME")]
        node_name: String,
        /// Namespace hosting pool, overlap and node-slice objects.
        #[arg(long, env = "WHEREABOUTS_NAMESPACE", default_value = "kube-system")]
        namespace: String,
        /// Path to the redb database file.
        #[arg(long, default_value = "./ipamd.redb")]
        data_dir: String,
        /// Base URL of the cluster API server.
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        cluster_api: String,
        /// Directory of per-network attachment-definition JSON files, used
        /// to resolve a deleted pod's network attachments back to IPAM
        /// config during cleanup.
        #[arg(long, default_value = "/etc/cni/net.d/ipamd.d")]
        config_dir: PathBuf,
    },
    /// Run the batch reconciler once (or on an interval with --watch).
    Reconcile {
        #[arg(long, env = "WHEREABOUTS_NAMESPACE", default_value = "kube-system")]
        namespace: String,
        #[arg(long, default_value = "./ipamd.redb")]
        data_dir: String,
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        cluster_api: String,
        /// Keep reconciling on this interval instead of exiting after one pass.
        #[arg(long)]
        watch_interval_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        None => run_cni_plugin().await,
        Some(Commands::Agent {
            node_name,
            namespace,
            data_dir,
            cluster_api,
            config_dir,
        }) => run_agent(&node_name, &namespace, &data_dir, &cluster_api, &config_dir).await,
        Some(Commands::Reconcile {
            namespace,
            data_dir,
            cluster_api,
            watch_interval_secs,
        }) => run_reconcile(&namespace, &data_dir, &cluster_api, watch_interval_secs).await,
    };

    match result {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("{:?}", e);
            ExitCode::from(cni::EXIT_UNKNOWN_FAILURE as u8)
        }
    }
}

async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

fn open_store(data_dir: &str) -> miette::Result<Arc<RedbBackend>> {
    Ok(Arc::new(RedbBackend::new(data_dir).map_err(|e| {
        miette::miette!("failed to open storage at '{}': {}", data_dir, e)
    })?))
}

/// Default arm: the attachment plugin, dispatched by `CNI_COMMAND`.
async fn run_cni_plugin() -> miette::Result<i32> {
    let env = cni::CniEnv::from_process_env()
        .map_err(|e| miette::miette!("{}", e))?;
    let net_conf = cni::load_net_conf().map_err(|e| miette::miette!("{}", e))?;

    let data_dir = std::env::var("IPAMD_DATA_DIR").unwrap_or_else(|_| "/var/lib/cni/ipamd.redb".to_string());
    let store = open_store(&data_dir)?;

    match env.command {
        cni::CniCommand::Add => match cni::run_add(store, &env, &net_conf).await {
            Ok(entries) => {
                println!(
                    "{}",
                    serde_json::to_string(&entries)
                        .map_err(|e| miette::miette!("failed to encode return envelope: {}", e))?
                );
                Ok(0)
            }
            Err(e) => {
                eprintln!("{:?}", e);
                Ok(cni::EXIT_UNKNOWN_FAILURE)
            }
        },
        cni::CniCommand::Del => match cni::run_del(store, &env, &net_conf).await {
            Ok(()) => Ok(0),
            Err(e) => {
                eprintln!("{:?}", e);
                Ok(cni::EXIT_UNKNOWN_FAILURE)
            }
        },
        cni::CniCommand::Check => Ok(0),
    }
}

/// `agent` subcommand: C6 + C7 as long-running `tokio::select!`-driven
/// tasks, shut down together on SIGINT/SIGTERM.
async fn run_agent(
    node_name: &str,
    namespace: &str,
    data_dir: &str,
    cluster_api: &str,
    config_dir: &PathBuf,
) -> miette::Result<i32> {
    info!(node_name, "starting ipamd agent");

    let store = open_store(data_dir)?;
    let client = Arc::new(
        ClusterClient::new(cluster_api.to_string(), std::env::var("KUBERNETES_TOKEN").ok())
            .map_err(|e| miette::miette!("failed to build cluster client: {}", e))?,
    );
    let event_bus = Arc::new(EventBus::default());
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), namespace.to_string()));
    let resolver = Arc::new(cni::OnDiskResolver::new(config_dir.clone()));

    let cleanup = Arc::new(PodCleanupController::new(
        store.clone(),
        namespace.to_string(),
        orchestrator.clone(),
        resolver,
        event_bus.clone(),
        node_name.to_string(),
    ));

    let token = CancellationToken::new();
    let cleanup_token = token.clone();
    let cleanup_handle = tokio::spawn(async move { cleanup.run(cleanup_token).await });

    let slice_store = Arc::new(NodeSliceStore::new(store, namespace.to_string()));
    let slice_token = token.clone();
    let slice_config_dir = config_dir.clone();
    let slice_node_name = node_name.to_string();
    let slice_handle = tokio::spawn(async move {
        run_node_slice_loop(slice_store, &slice_config_dir, &slice_node_name, slice_token).await
    });

    let _client = client;

    let sig = shutdown_signal().await;
    info!(signal = sig, "shutting down");
    token.cancel();
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        futures_util::future::join(cleanup_handle, slice_handle),
    )
    .await;

    Ok(0)
}

/// C6: level-triggered, so a simple periodic scan of the attachment
/// definitions under `config_dir` is enough to keep every node-slice pool
/// converged, no event stream required.
async fn run_node_slice_loop(
    slice_store: Arc<NodeSliceStore<RedbBackend>>,
    config_dir: &std::path::Path,
    node_name: &str,
    cancel: CancellationToken,
) {
    let mut previously_seen: std::collections::HashSet<String> = std::collections::HashSet::new();

    loop {
        let mut seen_this_pass: std::collections::HashSet<String> = std::collections::HashSet::new();

        if let Ok(read_dir) = std::fs::read_dir(config_dir) {
            for entry in read_dir.flatten() {
                let Ok(raw) = std::fs::read_to_string(entry.path()) else {
                    continue;
                };
                let Ok(conf) = serde_json::from_str::<ipam_controller::NetConf>(&raw) else {
                    continue;
                };
                let (Some(network_name), Some(prefix)) =
                    (conf.network_name.clone(), conf.node_slice_size_prefix())
                else {
                    continue;
                };
                seen_this_pass.insert(network_name.clone());
                for range_conf in conf.ranges() {
                    let Ok(resolved) = range_conf.resolve() else {
                        continue;
                    };
                    if let Err(e) =
                        slice_store.ensure_pool(&network_name, &resolved.cidr, prefix, &network_name)
                    {
                        error!(network = %network_name, error = %e, "failed to reconcile node slice pool");
                        continue;
                    }
                    if let Err(e) = slice_store.assign_node(&network_name, node_name) {
                        error!(network = %network_name, node = %node_name, error = %e, "failed to assign node slice");
                    }
                }
            }
        }

        // A network that was here last pass but isn't now had its
        // attachment-definition deleted; subtract this node's ownership ref
        // so the pool is garbage-collected once every owner has done the same.
        for vanished in previously_seen.difference(&seen_this_pass) {
            if let Err(e) = slice_store.remove_owner(vanished, vanished) {
                error!(network = %vanished, error = %e, "failed to remove owner ref for vanished attachment-definition");
            }
        }
        previously_seen = seen_this_pass;

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {}
        }
    }
}

/// `reconcile` subcommand: one-shot (or `--watch-interval-secs`-repeated)
/// batch reconciliation. Pool and overlap sweeps are mapped to distinct
/// exit codes (3 and 4) so a caller can tell which half failed.
async fn run_reconcile(
    namespace: &str,
    data_dir: &str,
    cluster_api: &str,
    watch_interval_secs: Option<u64>,
) -> miette::Result<i32> {
    let store = match RedbBackend::new(data_dir) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "could not open storage for batch reconciler");
            return Ok(cni::EXIT_RECONCILER_START_FAILED);
        }
    };
    let client = match ClusterClient::new(cluster_api.to_string(), std::env::var("KUBERNETES_TOKEN").ok()) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "could not start batch reconciler's cluster client");
            return Ok(cni::EXIT_RECONCILER_START_FAILED);
        }
    };

    let reconciler = BatchReconciler::new(store, namespace.to_string(), client);

    loop {
        let mut report = match reconciler.run_pool_sweep().await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "batch reconciliation of pools failed");
                return Ok(cni::EXIT_POOL_RECONCILE_FAILED);
            }
        };
        if let Err(e) = reconciler.run_overlap_sweep(&mut report) {
            error!(error = %e, "batch reconciliation of overlap registry failed");
            return Ok(cni::EXIT_OVERLAP_RECONCILE_FAILED);
        }
        info!(
            pools_scanned = report.pools_scanned,
            reservations_removed = report.reservations_removed,
            overlap_entries_scanned = report.overlap_entries_scanned,
            overlap_entries_removed = report.overlap_entries_removed,
            "reconcile pass complete"
        );

        match watch_interval_secs {
            Some(secs) => tokio::time::sleep(std::time::Duration::from_secs(secs)).await,
            None => return Ok(0),
        }
    }
}
