//! Wire types shared by the coordinator, storage nodes and the CLI

use crate::common::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Response header carrying the BLAKE3 checksum of a downloaded file
pub const CHECKSUM_HEADER: &str = "x-distsync-checksum";

/// Periodic liveness report from a storage node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: NodeId,
    /// Base URL of the node's chunk API
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub capacity_bytes: u64,
    #[serde(default)]
    pub used_bytes: u64,
    #[serde(default)]
    pub chunk_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub ok: bool,
    /// True when the node was unknown or not live before this heartbeat
    pub rejoined: bool,
    /// Interval the coordinator expects heartbeats at
    pub interval_ms: u64,
}

/// Client-facing view of a stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    pub filename: String,
    pub total_size: u64,
    pub chunk_count: usize,
    pub chunk_size: u64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Storage node usage report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    pub node_id: NodeId,
    pub chunks: u64,
    pub used_bytes: u64,
    /// 0 means unlimited
    pub capacity_bytes: u64,
}

impl NodeStats {
    pub fn available_bytes(&self) -> Option<u64> {
        (self.capacity_bytes > 0).then(|| self.capacity_bytes.saturating_sub(self.used_bytes))
    }
}
