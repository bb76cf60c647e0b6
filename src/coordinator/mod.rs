//! Coordinator implementation
//!
//! The coordinator is responsible for:
//! - Placement (consistent hashing over a ring of virtual nodes)
//! - Liveness tracking from node heartbeats
//! - Upload fanout with write quorum, download with replica fallback
//! - Durable file metadata

pub mod chunk_store;
pub mod download;
pub mod http;
pub mod liveness;
pub mod metadata;
pub mod monitor;
pub mod placement;
pub mod ring;
pub mod server;
pub mod service;
pub mod upload;

pub use chunk_store::{ChunkStore, HttpChunkStore, MemoryChunkStore, NodeRegistry};
pub use download::{DownloadOptions, FileDownload};
pub use liveness::{LivenessTracker, NodeReport, NodeStatus};
pub use metadata::{ChunkDescriptor, FileRecord, MetadataStore};
pub use monitor::{LivenessMonitor, Transition};
pub use placement::{PlacementManager, PlacementPolicy};
pub use ring::{HashRing, VirtualNode, DEFAULT_VIRTUAL_NODES};
pub use server::CoordinatorServer;
pub use service::{ClusterStatus, Coordinator, NodeView};
pub use upload::{split_chunks, UploadOptions};
