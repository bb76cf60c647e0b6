//! Local chunk storage for a storage node
//!
//! Layout: `data_dir/chunks/aa/bb/<encoded key>.chunk`, where `aa/bb` are
//! the first two bytes of BLAKE3(key). Writes go to a unique temp file
//! which is fsynced and renamed over the final path, so a reader sees the
//! old object, the new one, or nothing.
//!
//! Puts and deletes of one key are serialized through a striped lock so the
//! size seen before a write is still the size on disk when usage is charged.

use crate::common::{blob_prefix, encode_key, Error, NodeId, NodeStats, Result};
use crate::coordinator::chunk_store::ChunkStore;
use async_trait::async_trait;
use bytes::Bytes;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

const CHUNK_EXT: &str = "chunk";
const TMP_EXT: &str = "tmp";
const KEY_LOCK_STRIPES: usize = 64;

#[derive(Debug, Default, Clone, Copy)]
struct Usage {
    bytes: u64,
    chunks: u64,
}

/// Chunk files on local disk
pub struct LocalChunkStore {
    node_id: NodeId,
    root: PathBuf,
    /// 0 means unlimited
    capacity_bytes: u64,
    usage: Mutex<Usage>,
    key_locks: Vec<AsyncMutex<()>>,
}

impl LocalChunkStore {
    /// Open or create a store under `data_dir`, measuring what is already
    /// there and discarding temp files from interrupted writes.
    pub fn open(node_id: impl Into<NodeId>, data_dir: &Path, capacity_bytes: u64) -> Result<Self> {
        let root = data_dir.join("chunks");
        fs::create_dir_all(&root)?;

        let mut usage = Usage::default();
        let mut discarded = 0usize;
        for level1 in fs::read_dir(&root)? {
            let level1 = level1?.path();
            if !level1.is_dir() {
                continue;
            }
            for level2 in fs::read_dir(&level1)? {
                let level2 = level2?.path();
                if !level2.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(&level2)? {
                    let entry = entry?;
                    let path = entry.path();
                    match path.extension().and_then(|e| e.to_str()) {
                        Some(CHUNK_EXT) => {
                            usage.bytes += entry.metadata()?.len();
                            usage.chunks += 1;
                        }
                        Some(TMP_EXT) => {
                            fs::remove_file(&path)?;
                            discarded += 1;
                        }
                        _ => {}
                    }
                }
            }
        }

        let node_id = node_id.into();
        tracing::info!(
            node = %node_id,
            chunks = usage.chunks,
            bytes = usage.bytes,
            discarded,
            "chunk store opened"
        );

        Ok(Self {
            node_id,
            root,
            capacity_bytes,
            usage: Mutex::new(usage),
            key_locks: (0..KEY_LOCK_STRIPES).map(|_| AsyncMutex::new(())).collect(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let (aa, bb) = blob_prefix(key);
        self.root
            .join(aa)
            .join(bb)
            .join(format!("{}.{}", encode_key(key), CHUNK_EXT))
    }

    fn key_lock(&self, key: &str) -> &AsyncMutex<()> {
        let digest = blake3::hash(key.as_bytes());
        let stripe = u16::from_be_bytes([digest.as_bytes()[0], digest.as_bytes()[1]]) as usize;
        &self.key_locks[stripe % self.key_locks.len()]
    }

    async fn existing_size(path: &Path) -> Result<Option<u64>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write (or overwrite) a chunk.
    pub async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let _guard = self.key_lock(key).lock().await;
        let previous = Self::existing_size(&path).await?;
        let size = data.len() as u64;

        // Reserve space before writing so concurrent puts cannot overshoot
        {
            let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
            let used_after = usage.bytes - previous.unwrap_or(0).min(usage.bytes) + size;
            if self.capacity_bytes > 0 && used_after > self.capacity_bytes {
                return Err(Error::CapacityExceeded {
                    needed: size,
                    available: self.capacity_bytes.saturating_sub(usage.bytes),
                });
            }
            usage.bytes = used_after;
            if previous.is_none() {
                usage.chunks += 1;
            }
        }

        if let Err(e) = self.write_atomic(&path, data).await {
            let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
            usage.bytes = usage.bytes.saturating_sub(size) + previous.unwrap_or(0);
            if previous.is_none() {
                usage.chunks = usage.chunks.saturating_sub(1);
            }
            return Err(e);
        }

        tracing::debug!(key, size, "chunk stored");
        Ok(())
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("{}.{}", Uuid::new_v4().simple(), TMP_EXT));

        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, path).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Read a chunk; `ChunkMissing` if absent.
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::ChunkMissing {
                node: self.node_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a chunk. Returns false if it was not there.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        let _guard = self.key_lock(key).lock().await;
        let Some(size) = Self::existing_size(&path).await? else {
            return Ok(false);
        };

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        usage.bytes = usage.bytes.saturating_sub(size);
        usage.chunks = usage.chunks.saturating_sub(1);
        Ok(true)
    }

    pub fn stats(&self) -> NodeStats {
        let usage = *self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        NodeStats {
            node_id: self.node_id.clone(),
            chunks: usage.chunks,
            used_bytes: usage.bytes,
            capacity_bytes: self.capacity_bytes,
        }
    }
}

#[async_trait]
impl ChunkStore for LocalChunkStore {
    async fn store(&self, key: &str, data: Bytes) -> Result<()> {
        self.put(key, &data).await
    }

    async fn fetch(&self, key: &str) -> Result<Bytes> {
        self.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        LocalChunkStore::delete(self, key).await.map(|_| ())
    }
}
