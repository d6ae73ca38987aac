//! pdgated.toml loading and cluster id resolution.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use pdgate_server::ServerConfig;
use pdgate_state::ClusterStore;

/// Daemon configuration: listener, data directory and the gateway's own
/// settings under `[server]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub grpc_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub server: ServerConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            grpc_addr: SocketAddr::from(([0, 0, 0, 0], 2379)),
            data_dir: PathBuf::from("/var/lib/pdgate"),
            server: ServerConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path` if given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

/// Decide the cluster id for this run.
///
/// A configured id must agree with the persisted one. With neither, a new
/// id is derived from the wall clock and persisted.
pub fn resolve_cluster_id(store: &ClusterStore, configured: Option<u64>) -> anyhow::Result<u64> {
    let persisted = store.get_cluster_id()?;
    let cluster_id = match (configured, persisted) {
        (Some(configured), Some(persisted)) if configured != persisted => {
            bail!("configured cluster id {configured} does not match persisted id {persisted}")
        }
        (_, Some(persisted)) => persisted,
        (Some(configured), None) => {
            store.put_cluster_id(configured)?;
            configured
        }
        (None, None) => {
            let generated = generate_cluster_id();
            store.put_cluster_id(generated)?;
            info!(cluster_id = generated, "generated new cluster id");
            generated
        }
    };
    Ok(cluster_id)
}

/// Unix seconds in the high half, sub-second nanos in the low half.
fn generate_cluster_id() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs() << 32) | u64::from(now.subsec_nanos())
}
