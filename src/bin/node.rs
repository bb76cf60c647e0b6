//! Storage node binary

use clap::{Parser, Subcommand};
use distsync::common::{parse_duration, Config};
use distsync::NodeServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "distsync-node")]
#[command(about = "distsync storage node: holds chunk replicas on local disk")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./distsync.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start storage node
    Serve {
        /// Node ID (stable across restarts)
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// URL the coordinator should use to reach this node
        #[arg(long)]
        advertise: Option<String>,

        /// Coordinator URL
        #[arg(long)]
        coordinator: Option<String>,

        /// Chunk directory
        #[arg(long)]
        data: Option<PathBuf>,

        /// Storage capacity in bytes (0 = unlimited)
        #[arg(long)]
        capacity: Option<u64>,

        /// Heartbeat period ("3s")
        #[arg(long, value_parser = duration_arg)]
        heartbeat_interval: Option<Duration>,
    },
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load_from(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            id,
            bind,
            advertise,
            coordinator,
            data,
            capacity,
            heartbeat_interval,
        } => {
            let mut node_config = config.node;
            if let Some(id) = id {
                node_config.node_id = id;
            }
            if let Some(bind) = bind {
                node_config.bind_addr = bind;
            }
            if advertise.is_some() {
                node_config.advertise_url = advertise;
            }
            if let Some(coordinator) = coordinator {
                node_config.coordinator_url = coordinator;
            }
            if let Some(data) = data {
                node_config.data_dir = data;
            }
            if let Some(capacity) = capacity {
                node_config.capacity_bytes = capacity;
            }
            if let Some(interval) = heartbeat_interval {
                node_config.heartbeat_interval_ms = interval.as_millis() as u64;
            }

            tokio::fs::create_dir_all(&node_config.data_dir).await?;
            NodeServer::new(node_config).serve().await?;
        }
    }

    Ok(())
}
