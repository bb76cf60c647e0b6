//! Coordinator binary

use clap::{Parser, Subcommand};
use distsync::common::{parse_duration, Config};
use distsync::CoordinatorServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "distsync-coord")]
#[command(about = "distsync coordinator: chunk placement, replication and file metadata")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./distsync.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordinator server
    Serve {
        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Metadata directory
        #[arg(long)]
        data: Option<PathBuf>,

        /// Replication factor
        #[arg(long)]
        replicas: Option<usize>,

        /// Acks required per chunk (defaults to the replication factor)
        #[arg(long)]
        write_quorum: Option<usize>,

        /// Accept chunks with fewer live replicas than requested
        #[arg(long)]
        allow_under_replication: bool,

        /// Chunk size in bytes
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Virtual nodes per storage node
        #[arg(long)]
        virtual_nodes: Option<usize>,

        /// Chunks replicated concurrently per upload
        #[arg(long)]
        pipeline_depth: Option<usize>,

        /// Silence after which a node stops receiving traffic ("10s", "500ms")
        #[arg(long, value_parser = duration_arg)]
        heartbeat_timeout: Option<Duration>,

        /// Bound on a single replica read or write
        #[arg(long, value_parser = duration_arg)]
        replica_timeout: Option<Duration>,
    },
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    // File and environment first, then command line on top
    let config = Config::load_from(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            bind,
            data,
            replicas,
            write_quorum,
            allow_under_replication,
            chunk_size,
            virtual_nodes,
            pipeline_depth,
            heartbeat_timeout,
            replica_timeout,
        } => {
            let mut coord_config = config.coordinator;
            if let Some(bind) = bind {
                coord_config.bind_addr = bind;
            }
            if let Some(data) = data {
                coord_config.data_dir = data;
            }
            if let Some(replicas) = replicas {
                coord_config.replicas = replicas;
            }
            if write_quorum.is_some() {
                coord_config.write_quorum = write_quorum;
            }
            if allow_under_replication {
                coord_config.allow_under_replication = true;
            }
            if let Some(chunk_size) = chunk_size {
                coord_config.chunk_size = chunk_size;
            }
            if let Some(virtual_nodes) = virtual_nodes {
                coord_config.virtual_nodes = virtual_nodes;
            }
            if let Some(depth) = pipeline_depth {
                coord_config.pipeline_depth = depth;
            }
            if let Some(timeout) = heartbeat_timeout {
                coord_config.heartbeat_timeout_ms = timeout.as_millis() as u64;
            }
            if let Some(timeout) = replica_timeout {
                coord_config.replica_timeout_ms = timeout.as_millis() as u64;
            }

            CoordinatorServer::new(coord_config).serve().await?;
        }
    }

    Ok(())
}
