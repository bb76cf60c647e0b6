//! Durable file metadata
//!
//! Stores:
//! - File records (filename → ordered chunk descriptors)
//! - Node registry (node id → last advertised address)
//!
//! The whole mapping lives in memory and is persisted as a single JSON
//! snapshot (`metadata.json`) written to a temp file, fsynced and renamed
//! into place. The in-memory map only changes after the snapshot is durable,
//! so a failed write leaves both memory and disk on the previous state.
//! A missing or unreadable snapshot opens as an empty store.

use crate::common::{object_key, Error, FileSummary, NodeId, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::io::AsyncWriteExt;

const SNAPSHOT_FILE: &str = "metadata.json";
const SNAPSHOT_TMP: &str = "metadata.json.tmp";
const SNAPSHOT_CORRUPT: &str = "metadata.json.corrupt";

/// One chunk of a stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: u64,
    pub chunk_id: String,
    pub size: u64,
    /// Nodes holding the chunk, in ring order; read preference order
    pub replicas: Vec<NodeId>,
    /// BLAKE3 of the chunk bytes
    pub checksum: String,
}

impl ChunkDescriptor {
    /// Key the chunk is stored under on every replica
    pub fn object_key(&self) -> String {
        object_key(&self.chunk_id, &self.checksum)
    }
}

/// A file as recorded after a successful upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub chunks: Vec<ChunkDescriptor>,
    pub total_size: u64,
    pub chunk_size: u64,
    /// BLAKE3 of the whole file
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    /// Does this record reference `key` on `node`?
    pub fn references(&self, node: &str, key: &str) -> bool {
        self.chunks
            .iter()
            .any(|c| c.replicas.iter().any(|r| r == node) && c.object_key() == key)
    }

    /// Every (node, object key) pair this record references
    pub fn placements(&self) -> Vec<(NodeId, String)> {
        self.chunks
            .iter()
            .flat_map(|c| {
                let key = c.object_key();
                c.replicas.iter().map(move |r| (r.clone(), key.clone()))
            })
            .collect()
    }
}

impl From<&FileRecord> for FileSummary {
    fn from(record: &FileRecord) -> Self {
        FileSummary {
            filename: record.filename.clone(),
            total_size: record.total_size,
            chunk_count: record.chunks.len(),
            chunk_size: record.chunk_size,
            checksum: record.checksum.clone(),
            created_at: record.created_at,
        }
    }
}

/// On-disk layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    files: BTreeMap<String, FileRecord>,
    #[serde(default)]
    nodes: BTreeMap<NodeId, Option<String>>,
}

/// Borrowed view used when writing a snapshot
#[derive(Serialize)]
struct SnapshotRef<'a> {
    files: BTreeMap<&'a str, &'a FileRecord>,
    nodes: &'a BTreeMap<NodeId, Option<String>>,
}

#[derive(Debug, Default)]
struct State {
    files: HashMap<String, Arc<FileRecord>>,
    nodes: BTreeMap<NodeId, Option<String>>,
}

impl State {
    fn encode(&self) -> Result<Vec<u8>> {
        let view = SnapshotRef {
            files: self
                .files
                .iter()
                .map(|(name, record)| (name.as_str(), record.as_ref()))
                .collect(),
            nodes: &self.nodes,
        };
        serde_json::to_vec_pretty(&view)
            .map_err(|e| Error::MetadataPersistence(format!("encode failed: {}", e)))
    }
}

/// Metadata store
pub struct MetadataStore {
    dir: PathBuf,
    state: RwLock<State>,
    /// Serializes snapshot writes
    write_gate: tokio::sync::Mutex<()>,
    file_locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl MetadataStore {
    /// Open or create a metadata store in `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(SNAPSHOT_FILE);
        let snapshot = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "metadata snapshot unreadable, starting empty"
                    );
                    if let Err(e) = std::fs::rename(&path, dir.join(SNAPSHOT_CORRUPT)) {
                        tracing::warn!(error = %e, "could not set corrupt snapshot aside");
                    }
                    Snapshot::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            files = snapshot.files.len(),
            nodes = snapshot.nodes.len(),
            "metadata loaded"
        );

        let state = State {
            files: snapshot
                .files
                .into_iter()
                .map(|(name, record)| (name, Arc::new(record)))
                .collect(),
            nodes: snapshot.nodes,
        };

        Ok(Self {
            dir,
            state: RwLock::new(state),
            write_gate: tokio::sync::Mutex::new(()),
            file_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // === File operations ===

    /// Insert or atomically replace a record. Returns the record it replaced.
    pub async fn put(&self, record: FileRecord) -> Result<Option<Arc<FileRecord>>> {
        let record = Arc::new(record);
        self.update(|state| {
            state
                .files
                .insert(record.filename.clone(), record.clone())
        })
        .await
    }

    pub fn get(&self, filename: &str) -> Option<Arc<FileRecord>> {
        self.read_state().files.get(filename).cloned()
    }

    /// Like [`MetadataStore::get`] but absence is `NotFound`.
    pub fn lookup(&self, filename: &str) -> Result<Arc<FileRecord>> {
        self.get(filename)
            .ok_or_else(|| Error::NotFound(filename.to_string()))
    }

    /// All records, sorted by filename
    pub fn list(&self) -> Vec<Arc<FileRecord>> {
        let mut records: Vec<Arc<FileRecord>> = self.read_state().files.values().cloned().collect();
        records.sort_by(|a, b| a.filename.cmp(&b.filename));
        records
    }

    pub fn file_count(&self) -> usize {
        self.read_state().files.len()
    }

    /// Remove a record. Returns it, or `None` if there was nothing to delete.
    pub async fn delete(&self, filename: &str) -> Result<Option<Arc<FileRecord>>> {
        if self.get(filename).is_none() {
            return Ok(None);
        }
        self.update(|state| state.files.remove(filename)).await
    }

    // === Node registry ===

    pub fn nodes(&self) -> BTreeMap<NodeId, Option<String>> {
        self.read_state().nodes.clone()
    }

    /// Remember a node and its address. Persists only when something changed.
    pub async fn put_node(&self, node: &str, address: Option<String>) -> Result<bool> {
        if let Some(known) = self.read_state().nodes.get(node) {
            if address.is_none() || *known == address {
                return Ok(false);
            }
        }
        self.update(|state| {
            state.nodes.insert(node.to_string(), address.clone());
        })
        .await?;
        Ok(true)
    }

    pub async fn remove_node(&self, node: &str) -> Result<bool> {
        if !self.read_state().nodes.contains_key(node) {
            return Ok(false);
        }
        self.update(|state| state.nodes.remove(node).is_some()).await
    }

    // === Per-file exclusion ===

    /// Exclusive access to `filename` for the lifetime of the guard.
    ///
    /// Uploads and deletes of the same name are serialized through this;
    /// different names never contend.
    pub async fn lock_file(&self, filename: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .file_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match locks.get(filename).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    locks.retain(|_, weak| weak.strong_count() > 0);
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(filename.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    // === Internals ===

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `change` to a copy of the state, persist the copy, then swap it in.
    async fn update<T>(&self, change: impl FnOnce(&mut State) -> T) -> Result<T> {
        let _gate = self.write_gate.lock().await;

        let (next, out, bytes) = {
            let current = self.read_state();
            let mut next = State {
                files: current.files.clone(),
                nodes: current.nodes.clone(),
            };
            drop(current);
            let out = change(&mut next);
            let bytes = next.encode()?;
            (next, out, bytes)
        };

        self.persist(&bytes).await?;

        *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(out)
    }

    async fn persist(&self, bytes: &[u8]) -> Result<()> {
        let tmp = self.dir.join(SNAPSHOT_TMP);
        let path = self.dir.join(SNAPSHOT_FILE);

        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &path).await?;
            // Make the rename itself durable
            if let Ok(dir) = tokio::fs::File::open(&self.dir).await {
                let _ = dir.sync_all().await;
            }
            Ok::<(), std::io::Error>(())
        };

        write.await.map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "metadata write failed");
            Error::MetadataPersistence(e.to_string())
        })
    }
}
