//! Hermes daemon - per-node buffering core service
//!
//! Creates the shared-memory segment, initializes the buffer pool and
//! metadata directory in it, and serves the metadata and buffer gRPC
//! services that make this node reachable from the rest of the
//! installation.

use anyhow::Result;
use clap::Parser;
use hermes_common::{config::full_shmem_name, Config};
use hermes_daemon::HermesNode;
use hermes_proto::buffer::buffer_service_server::BufferServiceServer;
use hermes_proto::metadata::metadata_service_server::MetadataServiceServer;
use std::path::PathBuf;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "hermes-daemon")]
#[command(about = "Hermes buffering core daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/hermes/hermes.toml")]
    config: String,

    /// Listen address for gRPC (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// This node's id (overrides the config file)
    #[arg(long)]
    node_id: Option<u32>,

    /// Directory holding the shared-memory segment file
    #[arg(long, default_value = "/dev/shm")]
    shmem_dir: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load config file if it exists; CLI flags take precedence.
    let mut config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: failed to parse config file: {e}");
            Config::default()
        })
    } else {
        Config::default()
    };
    if let Some(listen) = args.listen {
        config.rpc.listen = listen;
    }
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting Hermes daemon");
    info!(config_file = %args.config, node_id = config.node_id, "configuration loaded");

    // The handler pool is fixed-size and configured, not elastic.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.rpc.num_worker_threads.max(1))
        .enable_all()
        .build()?;
    runtime.block_on(run(config, args.shmem_dir))
}

async fn run(config: Config, shmem_dir: PathBuf) -> Result<()> {
    let segment_path = shmem_dir.join(full_shmem_name(&config.shmem_name));
    info!(path = %segment_path.display(), "shared-memory segment");

    let node = match HermesNode::bootstrap(&config, &segment_path) {
        Ok(node) => node,
        Err(e) => {
            error!("failed to bootstrap node: {e}");
            std::process::exit(1);
        }
    };

    let sysview_loop = node.spawn_sysview_loop(config.system_view_state_update_interval_ms);

    let addr = config
        .rpc
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address {}: {e}", config.rpc.listen))?;
    let service = node.service();

    info!(%addr, "serving metadata and buffer services");
    Server::builder()
        .add_service(MetadataServiceServer::new(service.clone()))
        .add_service(BufferServiceServer::new(service))
        .serve_with_shutdown(addr, async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down");
        })
        .await?;

    sysview_loop.abort();
    info!("daemon stopped");
    Ok(())
}
