//! Upload path: chunk, place, fan out, commit
//!
//! The body is cut into fixed-size chunks. Each chunk is written to its
//! live replica set concurrently; a failed or timed-out replica is replaced
//! by the next live node on the ring. Up to `pipeline_depth` chunks are in
//! flight at once. The file record is written only after every chunk has
//! reached its write quorum, so a failed upload never changes metadata.

use crate::common::{
    blake3_hash, chunk_id, object_key, validate_filename, Blake3Hasher, Error, NodeId, Result,
};
use crate::coordinator::metadata::{ChunkDescriptor, FileRecord};
use crate::coordinator::service::Coordinator;
use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::pin_mut;
use futures_util::stream::{FuturesUnordered, Stream, StreamExt};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

/// Per-call upload knobs
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadOptions {
    /// Bound on the data transfer phase. The metadata commit that follows
    /// is never interrupted.
    pub deadline: Option<Duration>,
    /// Chunks replicated concurrently; `None` uses the configured depth
    pub pipeline_depth: Option<usize>,
}

impl UploadOptions {
    /// One chunk at a time, as the benchmark's baseline
    pub fn sequential() -> Self {
        Self {
            pipeline_depth: Some(1),
            ..Default::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Cut a byte stream into `chunk_size` pieces. Only the last one may be
/// shorter; an empty body yields nothing.
pub fn split_chunks<S, E>(body: S, chunk_size: usize) -> impl Stream<Item = Result<Bytes>>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let chunk_size = chunk_size.max(1);
    try_stream! {
        pin_mut!(body);
        let mut buf = BytesMut::with_capacity(chunk_size);

        while let Some(piece) = body.next().await {
            let mut piece = piece.map_err(|e| Error::Io(std::io::Error::other(e)))?;
            while !piece.is_empty() {
                let take = (chunk_size - buf.len()).min(piece.len());
                buf.extend_from_slice(&piece.split_to(take));
                if buf.len() == chunk_size {
                    yield buf.split().freeze();
                }
            }
        }

        if !buf.is_empty() {
            yield buf.split().freeze();
        }
    }
}

/// Every (node, object key) write attempted by one upload
#[derive(Debug, Default)]
struct WriteLedger {
    entries: Mutex<HashSet<(NodeId, String)>>,
}

impl WriteLedger {
    fn record(&self, node: &str, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((node.to_string(), key.to_string()));
    }

    fn take(&self) -> Vec<(NodeId, String)> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.drain().collect()
    }
}

/// Outcome of the data phase
struct Transfer {
    chunks: Vec<ChunkDescriptor>,
    total_size: u64,
    checksum: String,
}

type WriteSet = JoinSet<(NodeId, Result<()>)>;

impl Coordinator {
    /// Store `body` under `filename`, replacing any existing record.
    pub async fn upload<S, E>(
        &self,
        filename: &str,
        body: S,
        options: UploadOptions,
    ) -> Result<Arc<FileRecord>>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        validate_filename(filename)?;
        let span = tracing::info_span!("upload", id = %Uuid::new_v4(), filename);

        async move {
            let started = Instant::now();
            self.metrics().uploads_total.inc();

            // Held until commit or cleanup is done; same-name uploads and
            // deletes queue behind it.
            let _guard = self.metadata().lock_file(filename).await;

            let ledger = WriteLedger::default();
            let transfer = self.transfer(filename, body, options, &ledger);
            let transferred = match options.deadline {
                Some(deadline) => tokio::time::timeout(deadline, transfer)
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::Timeout(format!(
                            "upload did not finish within {:?}",
                            deadline
                        )))
                    }),
                None => transfer.await,
            };

            let result = match transferred {
                Ok(transfer) => self.commit(filename, transfer).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(record) => {
                    self.metrics().bytes_uploaded.add(record.total_size);
                    self.metrics()
                        .upload_latency
                        .observe_duration(started.elapsed());
                    tracing::info!(
                        size = record.total_size,
                        chunks = record.chunks.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "upload committed"
                    );
                    Ok(record)
                }
                Err(e) => {
                    self.metrics().uploads_failed.inc();
                    tracing::warn!(error = %e, "upload failed");
                    self.cleanup(filename, &ledger).await;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Read the body and replicate every chunk, keeping at most
    /// `pipeline_depth` chunks in flight.
    async fn transfer<S, E>(
        &self,
        filename: &str,
        body: S,
        options: UploadOptions,
        ledger: &WriteLedger,
    ) -> Result<Transfer>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let depth = options
            .pipeline_depth
            .unwrap_or(self.config().pipeline_depth)
            .max(1);
        let chunks = split_chunks(body, self.config().chunk_size);
        pin_mut!(chunks);

        let mut hasher = Blake3Hasher::new();
        let mut total_size = 0u64;
        let mut next_index = 0u64;
        let mut body_done = false;
        let mut in_flight: FuturesUnordered<BoxFuture<'_, Result<ChunkDescriptor>>> =
            FuturesUnordered::new();
        let mut done: BTreeMap<u64, ChunkDescriptor> = BTreeMap::new();

        loop {
            let can_read = !body_done && in_flight.len() < depth;
            if !can_read && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some(replicated) = in_flight.next(), if !in_flight.is_empty() => {
                    let descriptor = replicated?;
                    done.insert(descriptor.index, descriptor);
                }
                next = chunks.next(), if can_read => match next {
                    Some(data) => {
                        let data = data?;
                        hasher.update(&data);
                        total_size += data.len() as u64;
                        in_flight.push(
                            self.replicate_chunk(filename, next_index, data, ledger).boxed(),
                        );
                        next_index += 1;
                    }
                    None => body_done = true,
                },
                else => break,
            }
        }

        Ok(Transfer {
            chunks: done.into_values().collect(),
            total_size,
            checksum: hasher.finalize(),
        })
    }

    /// Write one chunk to its replica set and wait for the quorum.
    async fn replicate_chunk(
        &self,
        filename: &str,
        index: u64,
        data: Bytes,
        ledger: &WriteLedger,
    ) -> Result<ChunkDescriptor> {
        let chunk_id = chunk_id(filename, index);
        let checksum = blake3_hash(&data);
        let key = object_key(&chunk_id, &checksum);

        let targets = self.placement().write_targets(index, &chunk_id)?;
        let wanted = targets.len();
        let quorum = self.placement().policy().write_quorum;

        let mut attempted: HashSet<NodeId> = targets.iter().cloned().collect();
        let mut spares: Option<VecDeque<NodeId>> = None;
        let mut writes = WriteSet::new();
        for node in targets {
            self.spawn_write(&mut writes, node, &key, data.clone(), ledger);
        }

        let mut acked: Vec<NodeId> = Vec::with_capacity(wanted);
        while let Some(joined) = writes.join_next().await {
            let (node, result) = joined?;
            match result {
                Ok(()) => {
                    acked.push(node);
                    if acked.len() >= wanted {
                        break;
                    }
                }
                Err(e) => {
                    self.metrics().replica_write_failures.inc();
                    tracing::warn!(chunk = index, node = %node, error = %e, "replica write failed");

                    let spares = spares.get_or_insert_with(|| {
                        self.placement()
                            .spare_targets(&chunk_id, &attempted)
                            .into()
                    });
                    if let Some(spare) = spares.pop_front() {
                        tracing::debug!(chunk = index, node = %spare, "retrying on spare node");
                        attempted.insert(spare.clone());
                        self.spawn_write(&mut writes, spare, &key, data.clone(), ledger);
                    }
                }
            }
        }
        // Anything still running is no longer needed
        writes.abort_all();

        if acked.len() < quorum {
            return Err(Error::InsufficientReplicas {
                chunk: index,
                needed: quorum,
                available: acked.len(),
            });
        }
        if acked.len() < self.placement().policy().replicas {
            tracing::warn!(chunk = index, acked = acked.len(), "chunk stored under-replicated");
        }

        self.placement().ring_order(&chunk_id, &mut acked);
        self.metrics().chunks_written.add(acked.len() as u64);
        tracing::debug!(chunk = index, replicas = ?acked, "chunk replicated");

        Ok(ChunkDescriptor {
            index,
            chunk_id,
            size: data.len() as u64,
            replicas: acked,
            checksum,
        })
    }

    fn spawn_write(
        &self,
        writes: &mut WriteSet,
        node: NodeId,
        key: &str,
        data: Bytes,
        ledger: &WriteLedger,
    ) {
        ledger.record(&node, key);
        let store = self.nodes().get(&node);
        let timeout = self.config().replica_timeout();
        let key = key.to_string();

        writes.spawn(async move {
            let result = match store {
                None => Err(Error::ReplicaWrite {
                    node: node.clone(),
                    reason: "no address registered".into(),
                }),
                Some(store) => tokio::time::timeout(timeout, store.store(&key, data))
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::ReplicaWrite {
                            node: node.clone(),
                            reason: format!("timed out after {:?}", timeout),
                        })
                    }),
            };
            (node, result)
        });
    }

    async fn commit(&self, filename: &str, transfer: Transfer) -> Result<Arc<FileRecord>> {
        let record = FileRecord {
            filename: filename.to_string(),
            chunks: transfer.chunks,
            total_size: transfer.total_size,
            chunk_size: self.config().chunk_size as u64,
            checksum: transfer.checksum,
            created_at: Utc::now(),
        };

        let previous = self.metadata().put(record).await?;
        if let Some(previous) = previous {
            tracing::debug!(chunks = previous.chunks.len(), "replaced previous record");
            self.schedule_gc(filename, previous);
        }

        self.metadata()
            .get(filename)
            .ok_or_else(|| Error::Internal(format!("record for {} vanished", filename)))
    }

    /// Remove everything a failed upload wrote, except objects the current
    /// record still points at.
    async fn cleanup(&self, filename: &str, ledger: &WriteLedger) {
        let current = self.metadata().get(filename);
        let orphans: Vec<(NodeId, String)> = ledger
            .take()
            .into_iter()
            .filter(|(node, key)| {
                current
                    .as_ref()
                    .map_or(true, |record| !record.references(node, key))
            })
            .collect();
        if orphans.is_empty() {
            return;
        }

        let attempted = orphans.len();
        let removed = self.delete_objects(orphans).await;
        tracing::debug!(attempted, removed, "failed upload cleaned up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;

    async fn collect(pieces: &[&'static str], chunk_size: usize) -> Vec<Bytes> {
        let body = stream::iter(
            pieces
                .iter()
                .map(|p| Ok::<_, Infallible>(Bytes::from_static(p.as_bytes()))),
        );
        split_chunks(body, chunk_size)
            .map(|chunk| chunk.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_split_empty_body() {
        assert!(collect(&[], 4).await.is_empty());
        assert!(collect(&[""], 4).await.is_empty());
    }

    #[tokio::test]
    async fn test_split_regroups_pieces() {
        let chunks = collect(&["ab", "cdefg", "h", "ij"], 4).await;
        assert_eq!(
            chunks,
            vec![
                Bytes::from_static(b"abcd"),
                Bytes::from_static(b"efgh"),
                Bytes::from_static(b"ij"),
            ]
        );
    }

    #[tokio::test]
    async fn test_split_exact_multiple() {
        let chunks = collect(&["abcdefgh"], 4).await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 4));
    }

    #[tokio::test]
    async fn test_split_propagates_body_error() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(std::io::Error::other("connection reset")),
        ]);
        let results: Vec<Result<Bytes>> = split_chunks(body, 2).collect().await;
        assert!(results[0].is_ok());
        assert!(matches!(results.last(), Some(Err(Error::Io(_)))));
    }

    #[test]
    fn test_ledger_dedupes() {
        let ledger = WriteLedger::default();
        ledger.record("n1", "k");
        ledger.record("n1", "k");
        ledger.record("n2", "k");
        assert_eq!(ledger.take().len(), 2);
        assert!(ledger.take().is_empty());
    }
}
