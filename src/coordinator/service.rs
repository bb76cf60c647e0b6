//! The coordinator: owns the ring, liveness, metadata and node handles
//!
//! Uploads live in `upload.rs`, downloads in `download.rs`; this file holds
//! construction, membership (heartbeat / decommission), deletes and the
//! cluster status view.

use crate::common::{
    validate_filename, Clock, CoordinatorConfig, Error, HeartbeatAck, HeartbeatRequest, Metrics,
    NodeId, NodeState, Result,
};
use crate::coordinator::chunk_store::{ChunkStore, NodeRegistry};
use crate::coordinator::liveness::{LivenessTracker, NodeReport};
use crate::coordinator::metadata::{FileRecord, MetadataStore};
use crate::coordinator::placement::{PlacementManager, PlacementPolicy};
use crate::coordinator::ring::HashRing;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Cheap to clone; every clone shares the same state.
#[derive(Clone)]
pub struct Coordinator {
    config: Arc<CoordinatorConfig>,
    placement: Arc<PlacementManager>,
    metadata: Arc<MetadataStore>,
    nodes: Arc<NodeRegistry>,
    metrics: Arc<Metrics>,
}

/// One node as shown by `/cluster/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub node_id: NodeId,
    pub state: NodeState,
    pub on_ring: bool,
    pub address: Option<String>,
    /// Milliseconds since the last heartbeat, absent if none was seen since
    /// the coordinator started
    pub last_heartbeat_ms: Option<u64>,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub chunk_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub replicas: usize,
    pub write_quorum: usize,
    pub ring_nodes: usize,
    pub virtual_nodes: usize,
    pub live_nodes: usize,
    pub files: usize,
    /// Chunks with fewer than R live replicas right now
    pub under_replicated_chunks: usize,
    pub nodes: Vec<NodeView>,
}

impl Coordinator {
    /// Open the metadata store under `config.data_dir` and rebuild the ring
    /// from the persisted node registry. Restored nodes stay non-live until
    /// they heartbeat.
    pub fn open(config: CoordinatorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let metadata = MetadataStore::open(&config.data_dir)?;
        let nodes = NodeRegistry::new();

        let mut ring = HashRing::new(config.virtual_nodes);
        for (node, address) in metadata.nodes() {
            ring.add_node(&node);
            if let Some(address) = address {
                nodes.register_http(&node, &address);
            }
        }

        Ok(Self::assemble(config, clock, ring, metadata, nodes))
    }

    fn assemble(
        config: CoordinatorConfig,
        clock: Arc<dyn Clock>,
        ring: HashRing,
        metadata: MetadataStore,
        nodes: NodeRegistry,
    ) -> Self {
        let policy = PlacementPolicy {
            allow_under_replication: config.allow_under_replication,
            ..PlacementPolicy::new(config.replicas, config.write_quorum())
        };
        let liveness = Arc::new(LivenessTracker::new(config.heartbeat_timeout()));
        let metrics = Arc::new(Metrics::new());
        metrics.ring_nodes.set(ring.len() as u64);

        Self {
            config: Arc::new(config),
            placement: Arc::new(PlacementManager::new(ring, liveness, clock, policy)),
            metadata: Arc::new(metadata),
            nodes: Arc::new(nodes),
            metrics,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn placement(&self) -> &Arc<PlacementManager> {
        &self.placement
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Route a node's chunks through `store` instead of HTTP.
    pub fn register_store(&self, node: &str, store: Arc<dyn ChunkStore>) {
        self.nodes.insert(node, store);
    }

    // === Membership ===

    /// Record a heartbeat. Unknown nodes join the ring; known nodes that had
    /// timed out become live again with no further handshake.
    pub async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatAck> {
        if req.node_id.trim().is_empty() {
            return Err(Error::InvalidConfig("node_id cannot be empty".into()));
        }

        let report = NodeReport {
            address: req.address.clone(),
            capacity_bytes: req.capacity_bytes,
            used_bytes: req.used_bytes,
            chunk_count: req.chunk_count,
        };
        let now = self.placement.clock().now();
        let rejoined = self
            .placement
            .liveness()
            .heartbeat_with(&req.node_id, report, now);

        if let Some(address) = &req.address {
            if self.nodes.register_http(&req.node_id, address) {
                tracing::info!(node = %req.node_id, %address, "node address registered");
            }
        }
        self.metadata
            .put_node(&req.node_id, req.address.clone())
            .await?;

        if self.placement.add_node(&req.node_id) {
            tracing::info!(node = %req.node_id, "node joined the ring");
            self.metrics
                .ring_nodes
                .set(self.placement.ring_nodes().len() as u64);
        } else if rejoined {
            tracing::info!(node = %req.node_id, "node is live again");
        }
        self.metrics
            .live_nodes
            .set(self.placement.live_nodes().len() as u64);

        Ok(HeartbeatAck {
            ok: true,
            rejoined,
            interval_ms: self.config.heartbeat_interval_ms,
        })
    }

    /// Take a node out of the cluster for good, rehashing its share of the
    /// ring onto the remaining nodes. Returns false for an unknown node.
    pub async fn decommission(&self, node: &str) -> Result<bool> {
        let on_ring = self.placement.remove_node(node);
        let tracked = self.placement.liveness().forget(node);
        let registered = self.nodes.remove(node);
        let persisted = self.metadata.remove_node(node).await?;

        let known = on_ring || tracked || registered || persisted;
        if known {
            tracing::warn!(node = %node, "node decommissioned");
            self.metrics
                .ring_nodes
                .set(self.placement.ring_nodes().len() as u64);
            self.metrics
                .live_nodes
                .set(self.placement.live_nodes().len() as u64);
        }
        Ok(known)
    }

    // === Files ===

    pub fn file(&self, filename: &str) -> Result<Arc<FileRecord>> {
        validate_filename(filename)?;
        self.metadata.lookup(filename)
    }

    pub fn files(&self) -> Vec<Arc<FileRecord>> {
        self.metadata.list()
    }

    /// Remove a file's record. Its chunk objects are collected after the
    /// GC grace period so in-flight downloads can finish.
    pub async fn delete(&self, filename: &str) -> Result<()> {
        validate_filename(filename)?;
        let _guard = self.metadata.lock_file(filename).await;

        match self.metadata.delete(filename).await? {
            Some(removed) => {
                tracing::info!(filename, chunks = removed.chunks.len(), "file deleted");
                self.schedule_gc(filename, removed);
                Ok(())
            }
            None => Err(Error::NotFound(filename.to_string())),
        }
    }

    /// Delete objects from nodes, best effort. Returns how many deletes
    /// succeeded.
    pub(crate) async fn delete_objects(&self, objects: Vec<(NodeId, String)>) -> usize {
        let timeout = self.config.replica_timeout();
        let deletes = objects.into_iter().map(|(node, key)| {
            let store = self.nodes.get(&node);
            async move {
                let Some(store) = store else {
                    tracing::debug!(node = %node, key = %key, "no handle for node, object left behind");
                    return false;
                };
                match tokio::time::timeout(timeout, store.delete(&key)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        tracing::debug!(node = %node, key = %key, error = %e, "object delete failed");
                        false
                    }
                    Err(_) => {
                        tracing::debug!(node = %node, key = %key, "object delete timed out");
                        false
                    }
                }
            }
        });

        join_all(deletes).await.into_iter().filter(|ok| *ok).count()
    }

    /// After the grace period, delete objects of `old` that the current
    /// record for `filename` (if any) no longer references.
    pub(crate) fn schedule_gc(&self, filename: &str, old: Arc<FileRecord>) {
        let this = self.clone();
        let filename = filename.to_string();
        let grace = self.config.gc_grace();

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let collected = this.collect_garbage(&filename, &old).await;
            if collected > 0 {
                tracing::debug!(filename = %filename, collected, "superseded chunks collected");
            }
        });
    }

    pub(crate) async fn collect_garbage(&self, filename: &str, old: &FileRecord) -> usize {
        let _guard = self.metadata.lock_file(filename).await;
        let current = self.metadata.get(filename);

        let garbage: Vec<(NodeId, String)> = old
            .placements()
            .into_iter()
            .filter(|(node, key)| {
                current
                    .as_ref()
                    .map_or(true, |record| !record.references(node, key))
            })
            .collect();

        let collected = self.delete_objects(garbage).await;
        self.metrics.chunks_collected.add(collected as u64);
        collected
    }

    // === Status ===

    pub fn cluster_status(&self) -> ClusterStatus {
        let liveness = self.placement.liveness();
        let now = self.placement.clock().now();
        let ring_nodes: BTreeSet<NodeId> = self.placement.ring_nodes().into_iter().collect();
        let live = liveness.snapshot_live(now);

        let mut nodes: Vec<NodeView> = Vec::new();
        let mut seen = BTreeSet::new();
        for status in liveness.statuses(now) {
            seen.insert(status.node_id.clone());
            nodes.push(NodeView {
                on_ring: ring_nodes.contains(&status.node_id),
                address: status
                    .report
                    .address
                    .clone()
                    .or_else(|| self.nodes.address(&status.node_id)),
                last_heartbeat_ms: Some(
                    now.saturating_duration_since(status.last_heartbeat_at)
                        .as_millis() as u64,
                ),
                capacity_bytes: status.report.capacity_bytes,
                used_bytes: status.report.used_bytes,
                chunk_count: status.report.chunk_count,
                state: status.state,
                node_id: status.node_id,
            });
        }
        // Restored from metadata but silent since startup
        for node in ring_nodes.iter().filter(|n| !seen.contains(*n)) {
            nodes.push(NodeView {
                node_id: node.clone(),
                state: NodeState::Dead,
                on_ring: true,
                address: self.nodes.address(node),
                last_heartbeat_ms: None,
                capacity_bytes: 0,
                used_bytes: 0,
                chunk_count: 0,
            });
        }
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        let policy = self.placement.policy();
        let files = self.metadata.list();
        let under_replicated_chunks = files
            .iter()
            .flat_map(|record| record.chunks.iter())
            .filter(|chunk| {
                chunk.replicas.iter().filter(|r| live.contains(*r)).count() < policy.replicas
            })
            .count();

        ClusterStatus {
            replicas: policy.replicas,
            write_quorum: policy.write_quorum,
            ring_nodes: ring_nodes.len(),
            virtual_nodes: self.placement.vnode_count(),
            live_nodes: live.len(),
            files: files.len(),
            under_replicated_chunks,
            nodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ManualClock;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> CoordinatorConfig {
        CoordinatorConfig {
            data_dir: dir.path().to_path_buf(),
            virtual_nodes: 16,
            ..Default::default()
        }
    }

    fn beat(node: &str) -> HeartbeatRequest {
        HeartbeatRequest {
            node_id: node.to_string(),
            address: Some(format!("http://{}:6000", node)),
            capacity_bytes: 0,
            used_bytes: 0,
            chunk_count: 0,
        }
    }

    #[tokio::test]
    async fn test_heartbeat_joins_ring() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new());
        let coord = Coordinator::open(config(&dir), clock.clone()).unwrap();

        let ack = coord.heartbeat(beat("n1")).await.unwrap();
        assert!(ack.ok);
        assert!(ack.rejoined);
        assert!(coord.placement().contains("n1"));
        assert!(coord.nodes().get("n1").is_some());

        let ack = coord.heartbeat(beat("n1")).await.unwrap();
        assert!(!ack.rejoined);

        clock.advance(Duration::from_secs(30));
        assert!(!coord.placement().is_live("n1"));
        // Still on the ring while dead
        assert!(coord.placement().contains("n1"));

        let ack = coord.heartbeat(beat("n1")).await.unwrap();
        assert!(ack.rejoined);
        assert!(coord.placement().is_live("n1"));
    }

    #[tokio::test]
    async fn test_empty_node_id_rejected() {
        let dir = TempDir::new().unwrap();
        let coord = Coordinator::open(config(&dir), Arc::new(ManualClock::new())).unwrap();
        assert!(coord.heartbeat(beat(" ")).await.is_err());
    }

    #[tokio::test]
    async fn test_ring_restored_from_metadata() {
        let dir = TempDir::new().unwrap();
        {
            let coord = Coordinator::open(config(&dir), Arc::new(ManualClock::new())).unwrap();
            coord.heartbeat(beat("n1")).await.unwrap();
            coord.heartbeat(beat("n2")).await.unwrap();
        }

        let coord = Coordinator::open(config(&dir), Arc::new(ManualClock::new())).unwrap();
        assert_eq!(coord.placement().ring_nodes(), vec!["n1", "n2"]);
        assert!(!coord.placement().is_live("n1"));
        assert_eq!(coord.nodes().address("n2").as_deref(), Some("http://n2:6000"));

        let status = coord.cluster_status();
        assert_eq!(status.ring_nodes, 2);
        assert_eq!(status.live_nodes, 0);
        assert!(status.nodes.iter().all(|n| n.state == NodeState::Dead));
    }

    #[tokio::test]
    async fn test_decommission() {
        let dir = TempDir::new().unwrap();
        let coord = Coordinator::open(config(&dir), Arc::new(ManualClock::new())).unwrap();
        coord.heartbeat(beat("n1")).await.unwrap();
        coord.heartbeat(beat("n2")).await.unwrap();

        assert!(coord.decommission("n1").await.unwrap());
        assert!(!coord.decommission("n1").await.unwrap());
        assert!(!coord.placement().contains("n1"));
        assert!(!coord.metadata().nodes().contains_key("n1"));

        let status = coord.cluster_status();
        assert_eq!(status.ring_nodes, 1);
        assert_eq!(status.nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_file() {
        let dir = TempDir::new().unwrap();
        let coord = Coordinator::open(config(&dir), Arc::new(ManualClock::new())).unwrap();
        assert!(matches!(
            coord.delete("nothing").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            coord.delete("").await,
            Err(Error::InvalidFilename(_))
        ));
    }
}
