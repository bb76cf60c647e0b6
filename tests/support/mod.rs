//! In-process cluster: one coordinator, in-memory nodes, a manual clock

#![allow(dead_code)]

use bytes::Bytes;
use distsync::common::{CoordinatorConfig, HeartbeatRequest, ManualClock};
use distsync::coordinator::{FileRecord, MemoryChunkStore, UploadOptions};
use distsync::{Coordinator, Result};
use futures_util::stream::{self, Stream};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct Cluster {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub coordinator: Coordinator,
    pub nodes: BTreeMap<String, Arc<MemoryChunkStore>>,
}

/// Small chunks and a small ring so tests stay fast
pub fn test_config(dir: &TempDir) -> CoordinatorConfig {
    CoordinatorConfig {
        data_dir: dir.path().to_path_buf(),
        chunk_size: 4,
        virtual_nodes: 16,
        replica_timeout_ms: 2_000,
        ..Default::default()
    }
}

impl Cluster {
    pub async fn start(nodes: usize) -> Self {
        Self::start_with(nodes, |_| {}).await
    }

    pub async fn start_with(nodes: usize, tweak: impl FnOnce(&mut CoordinatorConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        tweak(&mut config);

        let clock = Arc::new(ManualClock::new());
        let coordinator = Coordinator::open(config, clock.clone()).unwrap();
        let mut cluster = Self {
            dir,
            clock,
            coordinator,
            nodes: BTreeMap::new(),
        };
        for i in 1..=nodes {
            cluster.add_node(&format!("n{}", i)).await;
        }
        cluster
    }

    pub async fn add_node(&mut self, id: &str) -> Arc<MemoryChunkStore> {
        let store = Arc::new(MemoryChunkStore::new(id));
        self.coordinator.register_store(id, store.clone());
        self.nodes.insert(id.to_string(), store.clone());
        self.beat(id).await;
        store
    }

    pub fn node(&self, id: &str) -> &Arc<MemoryChunkStore> {
        &self.nodes[id]
    }

    pub async fn beat(&self, id: &str) {
        self.coordinator
            .heartbeat(HeartbeatRequest {
                node_id: id.to_string(),
                address: None,
                capacity_bytes: 0,
                used_bytes: 0,
                chunk_count: 0,
            })
            .await
            .unwrap();
    }

    /// Move time past the heartbeat timeout and keep only `alive` live.
    pub async fn expire_all_but(&self, alive: &[&str]) {
        let timeout = self.coordinator.config().heartbeat_timeout();
        self.clock.advance(timeout + Duration::from_secs(1));
        for id in alive {
            self.beat(id).await;
        }
    }

    pub async fn upload(&self, name: &str, data: &[u8]) -> Result<Arc<FileRecord>> {
        self.upload_with(name, data, UploadOptions::default()).await
    }

    pub async fn upload_with(
        &self,
        name: &str,
        data: &[u8],
        options: UploadOptions,
    ) -> Result<Arc<FileRecord>> {
        self.coordinator
            .upload(name, body(data, 3), options)
            .await
    }

    pub async fn download(&self, name: &str) -> Result<Bytes> {
        self.coordinator.download(name).await?.read_to_end().await
    }

    /// Objects held across all nodes
    pub fn object_count(&self) -> usize {
        self.nodes.values().map(|n| n.len()).sum()
    }
}

/// Body that arrives in `piece`-sized fragments, unrelated to the chunk size
pub fn body(data: &[u8], piece: usize) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> {
    let pieces: Vec<_> = data
        .chunks(piece.max(1))
        .map(|p| Ok(Bytes::copy_from_slice(p)))
        .collect();
    stream::iter(pieces)
}

/// Let spawned background work (read repair, GC) run
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
