//! Download path with replica fallback and read repair
//!
//! For each chunk, in stored order: try the recorded replicas that are live,
//! verifying every fetched chunk against its checksum, then fresh live ring
//! candidates. Replicas that turned out to be missing the chunk or holding
//! bad bytes are rewritten in the background once a good copy is found,
//! provided the file's current record still places the chunk there.

use crate::common::{blake3_hash, validate_filename, Error, NodeId, Result};
use crate::coordinator::metadata::{ChunkDescriptor, FileRecord};
use crate::coordinator::service::Coordinator;
use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{BoxStream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadOptions {
    /// Bound on the whole transfer
    pub deadline: Option<Duration>,
}

/// A file being streamed back, chunk by chunk
pub struct FileDownload {
    record: Arc<FileRecord>,
    stream: BoxStream<'static, Result<Bytes>>,
}

impl FileDownload {
    /// The record this download was resolved against
    pub fn record(&self) -> &Arc<FileRecord> {
        &self.record
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<Bytes>> {
        self.stream
    }

    /// Buffer the whole file. Meant for tests and small files.
    pub async fn read_to_end(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.record.total_size as usize);
        while let Some(chunk) = self.stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Coordinator {
    pub async fn download(&self, filename: &str) -> Result<FileDownload> {
        self.download_with(filename, DownloadOptions::default())
            .await
    }

    /// Resolve `filename` and return a stream of its bytes.
    ///
    /// The record is captured once, so a concurrent re-upload never mixes
    /// chunks of two versions into one download.
    pub async fn download_with(
        &self,
        filename: &str,
        options: DownloadOptions,
    ) -> Result<FileDownload> {
        validate_filename(filename)?;
        let record = self.metadata().lookup(filename)?;
        self.metrics().downloads_total.inc();

        let this = self.clone();
        let snapshot = record.clone();
        let deadline = options
            .deadline
            .map(|d| (d, tokio::time::Instant::now() + d));

        let stream = try_stream! {
            for chunk in snapshot.chunks.iter() {
                let fetched = match deadline {
                    Some((limit, at)) => {
                        tokio::time::timeout_at(at, this.fetch_chunk(&snapshot.filename, chunk))
                            .await
                            .unwrap_or_else(|_| {
                                Err(Error::Timeout(format!(
                                    "download did not finish within {:?}",
                                    limit
                                )))
                            })
                    }
                    None => this.fetch_chunk(&snapshot.filename, chunk).await,
                };
                let data = fetched.map_err(|e| {
                    this.metrics().downloads_failed.inc();
                    tracing::warn!(
                        filename = %snapshot.filename,
                        chunk = chunk.index,
                        error = %e,
                        "download failed"
                    );
                    e
                })?;
                this.metrics().bytes_downloaded.add(data.len() as u64);
                yield data;
            }
        };

        Ok(FileDownload {
            record,
            stream: stream.boxed(),
        })
    }

    /// Fetch one verified copy of a chunk.
    pub(crate) async fn fetch_chunk(&self, filename: &str, chunk: &ChunkDescriptor) -> Result<Bytes> {
        let key = chunk.object_key();
        let mut tried: HashSet<NodeId> = HashSet::new();
        let mut stale: Vec<NodeId> = Vec::new();

        for node in &chunk.replicas {
            if !self.placement().is_live(node) {
                tracing::debug!(chunk = chunk.index, node = %node, "skipping non-live replica");
                continue;
            }
            tried.insert(node.clone());
            match self.fetch_from(node, &key, chunk).await {
                Ok(data) => {
                    self.spawn_read_repair(filename, chunk, &key, &data, stale);
                    return Ok(data);
                }
                Err(e) => {
                    self.note_read_failure(chunk, node, &e);
                    if e.needs_repair() {
                        stale.push(node.clone());
                    }
                }
            }
        }

        let fresh = self
            .placement()
            .fallback_candidates(&chunk.chunk_id, &tried);
        if !fresh.is_empty() {
            self.metrics().read_fallbacks.inc();
            tracing::debug!(chunk = chunk.index, candidates = ?fresh, "falling back to ring candidates");
        }
        for node in &fresh {
            match self.fetch_from(node, &key, chunk).await {
                Ok(data) => {
                    self.spawn_read_repair(filename, chunk, &key, &data, stale);
                    return Ok(data);
                }
                Err(e) => self.note_read_failure(chunk, node, &e),
            }
        }

        Err(Error::ReplicaExhausted { chunk: chunk.index })
    }

    async fn fetch_from(&self, node: &str, key: &str, chunk: &ChunkDescriptor) -> Result<Bytes> {
        let store = self.nodes().get(node).ok_or_else(|| Error::ReplicaRead {
            node: node.to_string(),
            reason: "no address registered".into(),
        })?;

        let timeout = self.config().replica_timeout();
        let data = tokio::time::timeout(timeout, store.fetch(key))
            .await
            .map_err(|_| Error::ReplicaRead {
                node: node.to_string(),
                reason: format!("timed out after {:?}", timeout),
            })??;

        let actual = blake3_hash(&data);
        if actual != chunk.checksum {
            return Err(Error::ChecksumMismatch {
                expected: chunk.checksum.clone(),
                actual,
            });
        }
        Ok(data)
    }

    fn note_read_failure(&self, chunk: &ChunkDescriptor, node: &str, e: &Error) {
        self.metrics().replica_read_failures.inc();
        tracing::warn!(chunk = chunk.index, node = %node, error = %e, "replica read failed");
    }

    /// Rewrite a good copy onto replicas that lost or mangled it.
    ///
    /// Runs under the file lock and only touches replicas the current
    /// record still references, so a download of a superseded or deleted
    /// version cannot recreate objects garbage collection already removed.
    fn spawn_read_repair(
        &self,
        filename: &str,
        chunk: &ChunkDescriptor,
        key: &str,
        data: &Bytes,
        stale: Vec<NodeId>,
    ) {
        if stale.is_empty() {
            return;
        }

        let this = self.clone();
        let filename = filename.to_string();
        let key = key.to_string();
        let data = data.clone();
        let index = chunk.index;
        let timeout = self.config().replica_timeout();

        tokio::spawn(async move {
            let _guard = this.metadata().lock_file(&filename).await;
            let current = this.metadata().get(&filename);
            for node in stale {
                let referenced = current
                    .as_ref()
                    .map_or(false, |record| record.references(&node, &key));
                if !referenced {
                    tracing::debug!(chunk = index, node = %node, "replica no longer referenced, repair skipped");
                    continue;
                }
                let Some(store) = this.nodes().get(&node) else {
                    continue;
                };
                match tokio::time::timeout(timeout, store.store(&key, data.clone())).await {
                    Ok(Ok(())) => {
                        this.metrics().read_repairs.inc();
                        tracing::info!(chunk = index, node = %node, "replica repaired");
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(chunk = index, node = %node, error = %e, "read repair failed")
                    }
                    Err(_) => {
                        tracing::warn!(chunk = index, node = %node, "read repair timed out")
                    }
                }
            }
        });
    }
}
