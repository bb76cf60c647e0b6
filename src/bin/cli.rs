//! CLI for file transfer and cluster inspection

use clap::{Parser, Subcommand};
use distsync::client::{Client, UploadParams};
use distsync::common::{format_bytes, parse_duration};
use distsync::ops::run_benchmark;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "distsync")]
#[command(about = "distsync replicated file storage CLI")]
#[command(version)]
struct Cli {
    /// Coordinator URL
    #[arg(long, default_value = "http://localhost:5000", env = "DISTSYNC_COORDINATOR")]
    coordinator: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file
    Upload {
        /// Local file
        file: PathBuf,

        /// Stored name (defaults to the file's base name)
        #[arg(long)]
        name: Option<String>,

        /// Replicate one chunk at a time
        #[arg(long)]
        sequential: bool,

        /// Give up on the transfer after this long ("30s")
        #[arg(long, value_parser = duration_arg)]
        deadline: Option<Duration>,
    },

    /// Download a file
    Download {
        /// Stored name
        name: String,

        /// Output file (defaults to the stored name)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Delete a file
    Delete {
        /// Stored name
        name: String,
    },

    /// List stored files
    Ls,

    /// Show a file's chunk placement
    Meta {
        /// Stored name
        name: String,
    },

    /// Show cluster state
    Status,

    /// Remove a storage node from the ring for good
    Decommission {
        /// Node ID
        node_id: String,
    },

    /// Time a sequential against a pipelined round trip
    Benchmark {
        /// Local file to transfer
        #[arg(long)]
        file: PathBuf,

        /// Stored name (defaults to the file's base name)
        #[arg(long)]
        name: Option<String>,

        /// Print CSV instead of a table
        #[arg(long)]
        csv: bool,
    },
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn stored_name(name: Option<String>, file: &std::path::Path) -> anyhow::Result<String> {
    if let Some(name) = name {
        return Ok(name);
    }
    file.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("cannot derive a name from {}", file.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let client = Client::new(&cli.coordinator);

    match cli.command {
        Commands::Upload {
            file,
            name,
            sequential,
            deadline,
        } => {
            let name = stored_name(name, &file)?;
            let params = UploadParams {
                sequential,
                pipeline_depth: None,
                deadline,
            };
            let summary = client.upload_file(&name, &file, params).await?;
            println!("Uploaded {}", summary.filename);
            println!("  Size: {}", format_bytes(summary.total_size));
            println!("  Chunks: {}", summary.chunk_count);
            println!("  Checksum: {}", summary.checksum);
        }

        Commands::Download { name, output } => {
            let output = output.unwrap_or_else(|| PathBuf::from(&name));
            let report = client.download_file(&name, &output).await?;
            println!(
                "Downloaded {} -> {} ({})",
                name,
                output.display(),
                format_bytes(report.bytes)
            );
        }

        Commands::Delete { name } => {
            client.delete(&name).await?;
            println!("Deleted {}", name);
        }

        Commands::Ls => {
            for file in client.list().await? {
                println!(
                    "{:>12}  {:>5} chunks  {}  {}",
                    format_bytes(file.total_size),
                    file.chunk_count,
                    file.created_at.format("%Y-%m-%d %H:%M:%S"),
                    file.filename
                );
            }
        }

        Commands::Meta { name } => {
            let record = client.meta(&name).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        Commands::Status => {
            let status = client.cluster_status().await?;
            println!("Cluster status:");
            println!(
                "  Replicas: {} (write quorum {})",
                status.replicas, status.write_quorum
            );
            println!(
                "  Nodes: {} live / {} on ring",
                status.live_nodes, status.ring_nodes
            );
            println!("  Files: {}", status.files);
            println!("  Under-replicated chunks: {}", status.under_replicated_chunks);
            for node in &status.nodes {
                println!(
                    "  - {} {} used {} ({} chunks){}",
                    node.node_id,
                    node.state,
                    format_bytes(node.used_bytes),
                    node.chunk_count,
                    if node.on_ring { "" } else { " [off ring]" }
                );
            }
        }

        Commands::Decommission { node_id } => {
            client.decommission(&node_id).await?;
            println!("Decommissioned {}", node_id);
        }

        Commands::Benchmark { file, name, csv } => {
            let name = stored_name(name, &file)?;
            let report = run_benchmark(&client, &file, &name).await?;
            if csv {
                print!("{}", report.to_csv());
            } else {
                println!("Benchmark ({}, {} chunks)", format_bytes(report.bytes), report.chunks);
                println!("  Sequential:  {:.3}s", report.sequential_secs());
                println!("  Distributed: {:.3}s", report.distributed_secs());
                println!("  Speedup:     {:.2}x", report.speedup());
            }
        }
    }

    Ok(())
}
