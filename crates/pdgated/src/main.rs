//! pdgated — the placement driver gateway daemon.
//!
//! Assembles the gateway subsystems in one process:
//! - Cluster-state store (redb)
//! - ID allocator and timestamp oracle
//! - PD gRPC service (unary ops, TSO and region heartbeat streams)
//!
//! # Usage
//!
//! ```text
//! pdgated --config pdgated.toml --grpc-addr 0.0.0.0:2379 --data-dir /var/lib/pdgate
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pdgate_server::{Gateway, Leadership};
use pdgate_state::ClusterStore;

use crate::config::DaemonConfig;

const DEFAULT_LOG_FILTER: &str = "info,pdgated=debug,pdgate=debug";

#[derive(Parser)]
#[command(name = "pdgated", about = "Placement driver gateway daemon")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// gRPC listen address (overrides the config file).
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,

    /// Data directory for persistent state (overrides the config file).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Cluster id (overrides the config file).
    #[arg(long)]
    cluster_id: Option<u64>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<DaemonConfig> {
        let mut config = DaemonConfig::load(self.config.as_deref())?;
        if let Some(addr) = self.grpc_addr {
            config.grpc_addr = addr;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(id) = self.cluster_id {
            config.server.cluster_id = Some(id);
        }
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let config = cli.into_config()?;
    run(config).await
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("pdgate daemon starting");

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("pdgate.redb");
    let store = ClusterStore::open(&db_path)?;
    info!(path = ?db_path, "cluster store opened");

    let cluster_id = config::resolve_cluster_id(&store, config.server.cluster_id)?;
    info!(cluster_id, "cluster id resolved");

    // No election component is wired in: this member leads.
    let leadership = Leadership::new(config.server.member_id);
    leadership.set_leader(config.server.member_id);
    info!(member_id = config.server.member_id, "standalone member assumed leadership");

    let shutdown = CancellationToken::new();
    let gateway = Gateway::from_config(
        &config.server,
        store,
        cluster_id,
        leadership,
        shutdown.clone(),
    )?;

    info!(addr = %config.grpc_addr, "gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(gateway.into_service())
        .serve_with_shutdown(config.grpc_addr, async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            // Streams observe this and end before the server drains.
            shutdown.cancel();
        })
        .await?;

    info!("pdgate daemon stopped");
    Ok(())
}
