//! Common utilities and types shared across distsync

pub mod clock;
pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod protocol;
pub mod utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, CoordinatorConfig, NodeConfig, DEFAULT_CHUNK_SIZE};
pub use error::{Error, ErrorBody, Result};
pub use hash::{blake3_hash, blob_prefix, chunk_id, object_key, ring_position, Blake3Hasher};
pub use metrics::Metrics;
pub use protocol::{FileSummary, HeartbeatAck, HeartbeatRequest, NodeStats, CHECKSUM_HEADER};
pub use utils::{
    encode_key, format_bytes, parse_duration, shutdown_signal, validate_filename, NodeState,
};

/// Opaque storage node identifier, stable for the node's lifetime
pub type NodeId = String;
