//! The stdin/stdout plugin envelope (spec.md §6): parses the attachment
//! plugin's config and environment, resolves each configured range against
//! the orchestrator (C5), optionally routing through a node slice (C6), and
//! renders the return envelope or maps a failure to an exit code.

use ipam_controller::{ControllerError, NetConf, Orchestrator};
use ipam_engine::{clamp_bounds, Addr, CidrRange, ExclusionSet, PoolId, Request};
use ipam_storage::KVStore;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;

/// Our identifier in the CNI config's `ipam.type` field.
pub const PLUGIN_TYPE: &str = "ipamd";

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CniError {
    #[error("invalid plugin configuration: {0}")]
    #[diagnostic(code(ipam::invalid_config))]
    InvalidConfig(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Controller(#[from] ControllerError),

    #[error("missing required environment variable {0}")]
    #[diagnostic(code(ipam::missing_env))]
    MissingEnv(String),
}

pub type Result<T> = std::result::Result<T, CniError>;

/// Generic exit-1 mapping (spec.md §6's exit code table): every plugin
/// failure other than the batch-reconciler-specific 2/3/4 codes below is an
/// "unknown failure" to the CNI caller.
pub const EXIT_UNKNOWN_FAILURE: i32 = 1;
pub const EXIT_RECONCILER_START_FAILED: i32 = 2;
pub const EXIT_POOL_RECONCILE_FAILED: i32 = 3;
pub const EXIT_OVERLAP_RECONCILE_FAILED: i32 = 4;

/// The top-level CNI network configuration; only the `ipam` stanza matters
/// to this plugin, the rest of the chained config is opaque passthrough.
#[derive(Debug, Deserialize)]
struct CniConfig {
    ipam: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CniCommand {
    Add,
    Del,
    Check,
}

impl std::str::FromStr for CniCommand {
    type Err = CniError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ADD" => Ok(Self::Add),
            "DEL" => Ok(Self::Del),
            "CHECK" => Ok(Self::Check),
            other => Err(CniError::InvalidConfig(format!(
                "unsupported CNI_COMMAND '{}'",
                other
            ))),
        }
    }
}

/// The environment a CNI invocation always carries (spec.md §6).
pub struct CniEnv {
    pub command: CniCommand,
    pub container_id: String,
    pub interface_name: String,
    pub pod_ref: String,
    pub namespace: String,
}

impl CniEnv {
    pub fn from_process_env() -> Result<Self> {
        let command = env_var("CNI_COMMAND")?.parse()?;
        let container_id = env_var("CNI_CONTAINERID")?;
        let interface_name = env_var("CNI_IFNAME")?;
        let pod_ref = parse_cni_args(&std::env::var("CNI_ARGS").unwrap_or_default())
            .unwrap_or_else(|| format!("default/{}", container_id));
        let namespace =
            std::env::var("WHEREABOUTS_NAMESPACE").unwrap_or_else(|_| "kube-system".to_string());
        Ok(Self {
            command,
            container_id,
            interface_name,
            pod_ref,
            namespace,
        })
    }
}

fn env_var(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| CniError::MissingEnv(name.to_string()))
}

/// `CNI_ARGS` is a `;`-separated list of `KEY=VALUE` pairs; Kubernetes
/// kubelet sets `K8S_POD_NAMESPACE` and `K8S_POD_NAME`.
fn parse_cni_args(raw: &str) -> Option<String> {
    let mut namespace = None;
    let mut name = None;
    for pair in raw.split(';') {
        let (k, v) = pair.split_once('=')?;
        match k {
            "K8S_POD_NAMESPACE" => namespace = Some(v.to_string()),
            "K8S_POD_NAME" => name = Some(v.to_string()),
            _ => {}
        }
    }
    Some(format!("{}/{}", namespace?, name?))
}

#[derive(Debug, Serialize)]
pub struct ReturnEntry {
    pub version: u8,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<std::net::IpAddr>,
}

fn read_stdin_ipam_value() -> Result<serde_json::Value> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| CniError::InvalidConfig(format!("failed to read stdin: {}", e)))?;
    let config: CniConfig = serde_json::from_str(&buf)
        .map_err(|e| CniError::InvalidConfig(format!("malformed CNI config JSON: {}", e)))?;
    Ok(config.ipam)
}

/// Load, merge `configuration_path` cluster defaults under the per-attachment
/// config (per-attachment wins, spec.md §6), and validate the `type` field.
/// The merge happens at the raw JSON level, before defaults are applied, so
/// a field the attachment config never set still inherits the cluster
/// default rather than this struct's baked-in default.
pub fn load_net_conf() -> Result<NetConf> {
    let mut ipam_value = read_stdin_ipam_value()?;
    if let Some(path) = ipam_value
        .get("configuration_path")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
    {
        ipam_value = merge_cluster_defaults(ipam_value, &path)?;
    }

    let net_conf: NetConf = serde_json::from_value(ipam_value)
        .map_err(|e| CniError::InvalidConfig(format!("invalid ipam configuration: {}", e)))?;

    match net_conf.plugin_type.as_deref() {
        Some(t) if t == PLUGIN_TYPE => {}
        Some(other) => {
            return Err(CniError::InvalidConfig(format!(
                "ipam.type '{}' does not match this plugin ('{}')",
                other, PLUGIN_TYPE
            )))
        }
        None => {}
    }
    Ok(net_conf)
}

fn merge_cluster_defaults(attachment: serde_json::Value, path: &str) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CniError::InvalidConfig(format!("reading configuration_path '{}': {}", path, e)))?;
    let defaults: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| CniError::InvalidConfig(format!("parsing configuration_path '{}': {}", path, e)))?;

    match (defaults, attachment) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(overrides)) => {
            for (k, v) in overrides {
                base.insert(k, v);
            }
            Ok(serde_json::Value::Object(base))
        }
        (_, other) => Ok(other),
    }
}

/// Resolve the effective `(PoolId, CidrRange, Bounds, ExclusionSet)` for one
/// configured range, routing through the node slice controller when
/// `node_slice_size` activates node-slicing (spec.md §4.6).
pub async fn effective_pool<S: KVStore>(
    store: &Arc<S>,
    namespace: &str,
    net_conf: &NetConf,
    resolved: &ipam_controller::ResolvedRange,
    node_name: Option<&str>,
) -> Result<(PoolId, CidrRange, ipam_engine::Bounds, ExclusionSet)> {
    let exclusions = resolve_exclusions(&resolved.exclude)?;

    if let Some(prefix) = net_conf.node_slice_size_prefix() {
        let node_name = node_name.ok_or_else(|| CniError::MissingEnv("NODENAME".to_string()))?;
        let network_name = net_conf
            .network_name
            .clone()
            .ok_or_else(|| CniError::InvalidConfig("node_slice_size requires network_name".to_string()))?;

        let slice_store = ipam_controller::NodeSliceStore::new(store.clone(), namespace);
        slice_store.ensure_pool(&network_name, &resolved.cidr, prefix, &network_name)?;
        let slice = slice_store.assign_node(&network_name, node_name)?;
        let bounds = clamp_bounds(&slice, None, None)
            .map_err(|e| CniError::Controller(ControllerError::from(e)))?;
        let pool_id =
            PoolId::with_network_and_node(slice.to_cidr_string(), network_name, node_name);
        return Ok((pool_id, slice, bounds, exclusions));
    }

    let bounds = clamp_bounds(&resolved.cidr, resolved.range_start, resolved.range_end)
        .map_err(|e| CniError::Controller(ControllerError::from(e)))?;
    let pool_id = match &net_conf.network_name {
        Some(network_name) => PoolId::with_network(resolved.cidr.to_cidr_string(), network_name.clone()),
        None => PoolId::new(resolved.cidr.to_cidr_string()),
    };
    Ok((pool_id, resolved.cidr.clone(), bounds, exclusions))
}

fn resolve_exclusions(exclude: &[String]) -> Result<ExclusionSet> {
    let blocks = exclude
        .iter()
        .map(|s| CidrRange::parse(s).map_err(|e| CniError::Controller(ControllerError::from(e))))
        .collect::<Result<Vec<_>>>()?;
    Ok(ExclusionSet::new(blocks))
}

/// Run ADD: assign one address per configured range, returning the CNI
/// return envelope.
pub async fn run_add<S: KVStore>(
    store: Arc<S>,
    env: &CniEnv,
    net_conf: &NetConf,
) -> Result<Vec<ReturnEntry>> {
    let orchestrator = Orchestrator::new(store.clone(), env.namespace.clone());
    let node_name = std::env::var("NODENAME").ok();
    let collision_domain = net_conf
        .enable_overlapping_ranges
        .then(|| net_conf.network_name.clone())
        .flatten();

    let mut entries = Vec::new();
    for range_conf in net_conf.ranges() {
        let resolved = range_conf
            .resolve()
            .map_err(|e| CniError::Controller(ControllerError::from(e)))?;
        let (pool_id, range, bounds, exclusions) =
            effective_pool(&store, &env.namespace, net_conf, &resolved, node_name.as_deref()).await?;

        let request = Request {
            pod_ref: env.pod_ref.clone(),
            container_id: env.container_id.clone(),
            interface_name: env.interface_name.clone(),
            fixed_offset: None,
        };

        let reservation = orchestrator
            .assign_address(
                &pool_id,
                &range,
                &bounds,
                &exclusions,
                collision_domain.as_deref(),
                &request,
            )
            .await?;

        let address = ipam_engine::add_offset(&range.network(), reservation.offset)
            .map_err(|e| CniError::Controller(ControllerError::from(e)))?;
        entries.push(ReturnEntry {
            version: ip_version(&address),
            address: format!("{}/{}", address, range.prefix_len),
            gateway: net_conf.gateway,
        });
    }
    Ok(entries)
}

/// Run DEL: release every configured range's reservation for this
/// attachment. Unknown entries degrade to success (spec.md §7's `NotFound`
/// rule) since DEL must be idempotent.
pub async fn run_del<S: KVStore>(store: Arc<S>, env: &CniEnv, net_conf: &NetConf) -> Result<()> {
    let orchestrator = Orchestrator::new(store.clone(), env.namespace.clone());
    let node_name = std::env::var("NODENAME").ok();

    for range_conf in net_conf.ranges() {
        let resolved = range_conf
            .resolve()
            .map_err(|e| CniError::Controller(ControllerError::from(e)))?;
        let (pool_id, range, _bounds, _exclusions) =
            effective_pool(&store, &env.namespace, net_conf, &resolved, node_name.as_deref()).await?;

        orchestrator
            .release_address(
                &pool_id,
                &range,
                &env.pod_ref,
                &env.container_id,
                &env.interface_name,
            )
            .await?;
    }
    Ok(())
}

fn ip_version(addr: &Addr) -> u8 {
    match addr.family() {
        ipam_engine::Family::V4 => 4,
        ipam_engine::Family::V6 => 6,
    }
}

/// Implements [`ipam_controller::NetworkConfigResolver`] by reading one JSON
/// file per network name out of a directory — the on-disk form of the
/// cluster's attachment-definitions that the long-running agent (C6/C7)
/// needs, mirroring the CNI plugin's own stdin config shape.
pub struct OnDiskResolver {
    dir: std::path::PathBuf,
}

impl OnDiskResolver {
    pub fn new(dir: impl Into<std::path::PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ipam_controller::NetworkConfigResolver for OnDiskResolver {
    fn resolve(&self, network_name: &str) -> Option<NetConf> {
        let path = self.dir.join(format!("{}.json", network_name));
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}
