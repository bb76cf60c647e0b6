//! # distsync
//!
//! Chunked, replicated file storage across independent storage nodes:
//! - Fixed-size chunking with BLAKE3 checksums per chunk and per file
//! - Consistent-hash placement with virtual nodes
//! - Quorum replication with spare-node substitution on failure
//! - Heartbeat liveness; reads and writes skip nodes that went quiet
//! - Replica fallback and read repair on download
//!
//! ## Architecture
//!
//! ```text
//!            HTTP (PUT/GET /files/:name)
//!                      │
//! ┌────────────────────▼────────────────────┐
//! │              Coordinator                │
//! │  ring · liveness · placement · metadata │
//! └───────────┬─────────────────────────────┘
//!             │ HTTP (/chunks/:key)  ▲ heartbeats
//!   ┌─────────┴──────────┬───────────┴──┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌───▼────────┐
//! │ Node 1     │   │ Node 2     │   │ Node 3     │
//! │ chunk files│   │ chunk files│   │ chunk files│
//! └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a coordinator
//! ```bash
//! distsync-coord serve --bind 0.0.0.0:5000 --data ./coord-data --replicas 2
//! ```
//!
//! ### Start storage nodes
//! ```bash
//! distsync-node serve --id node-1 --bind 0.0.0.0:6001 --data ./node1 \
//!   --coordinator http://localhost:5000
//! ```
//!
//! ### Use the CLI
//! ```bash
//! distsync upload ./data.bin
//! distsync download data.bin --output ./copy.bin
//! distsync benchmark --file ./data.bin
//! ```

pub mod client;
pub mod common;
pub mod coordinator;
pub mod node;
pub mod ops;

// Re-export commonly used types
pub use client::Client;
pub use common::{Config, Error, Result};
pub use coordinator::{Coordinator, CoordinatorServer};
pub use node::NodeServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
