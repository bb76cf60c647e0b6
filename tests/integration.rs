//! Round trips through the coordinator with in-memory storage nodes

mod support;

use distsync::common::{blake3_hash, chunk_id, CoordinatorConfig, ManualClock};
use distsync::coordinator::{MemoryChunkStore, UploadOptions};
use distsync::{Coordinator, Error};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use support::{body, settle, Cluster};
use tempfile::TempDir;

#[tokio::test]
async fn test_empty_file_roundtrip() {
    let cluster = Cluster::start(3).await;

    let record = cluster.upload("empty.bin", b"").await.unwrap();
    assert_eq!(record.total_size, 0);
    assert!(record.chunks.is_empty());
    assert_eq!(record.checksum, blake3_hash(b""));

    assert!(cluster.download("empty.bin").await.unwrap().is_empty());
    assert_eq!(cluster.object_count(), 0);
}

#[tokio::test]
async fn test_single_chunk_roundtrip() {
    let cluster = Cluster::start(3).await;

    let record = cluster.upload("one.bin", b"abc").await.unwrap();
    assert_eq!(record.chunks.len(), 1);
    assert_eq!(record.chunks[0].size, 3);
    assert_eq!(record.chunks[0].replicas.len(), 2);

    assert_eq!(cluster.download("one.bin").await.unwrap().as_ref(), b"abc");
}

#[tokio::test]
async fn test_many_chunks_with_partial_tail() {
    let cluster = Cluster::start(4).await;
    let data: Vec<u8> = (0..=250u8).collect();

    let record = cluster.upload("tail.bin", &data).await.unwrap();
    assert_eq!(record.chunks.len(), 63);
    for (i, chunk) in record.chunks.iter().enumerate() {
        assert_eq!(chunk.index, i as u64);
        assert_eq!(chunk.chunk_id, chunk_id("tail.bin", i as u64));
        assert_eq!(chunk.replicas.len(), 2);
    }
    assert!(record.chunks[..62].iter().all(|c| c.size == 4));
    assert_eq!(record.chunks[62].size, 3);

    let downloaded = cluster.download("tail.bin").await.unwrap();
    assert_eq!(downloaded.as_ref(), data.as_slice());
    assert_eq!(record.checksum, blake3_hash(&data));
}

#[tokio::test]
async fn test_replicas_follow_the_ring() {
    let cluster = Cluster::start(5).await;
    let record = cluster.upload("placed.bin", b"0123456789abcdef").await.unwrap();

    for chunk in &record.chunks {
        let expected = cluster
            .coordinator
            .placement()
            .write_targets(chunk.index, &chunk.chunk_id)
            .unwrap();
        assert_eq!(chunk.replicas, expected);
        for node in &chunk.replicas {
            assert!(cluster.node(node).contains(&chunk.object_key()));
        }
    }
}

#[tokio::test]
async fn test_sequential_and_pipelined_store_the_same() {
    let cluster = Cluster::start(3).await;
    let data = vec![7u8; 41];

    let seq = cluster
        .upload_with("seq.bin", &data, UploadOptions::sequential())
        .await
        .unwrap();
    let piped = cluster
        .upload_with(
            "piped.bin",
            &data,
            UploadOptions {
                pipeline_depth: Some(8),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(seq.checksum, piped.checksum);
    assert_eq!(seq.chunks.len(), piped.chunks.len());
    assert_eq!(cluster.download("seq.bin").await.unwrap(), data);
    assert_eq!(cluster.download("piped.bin").await.unwrap(), data);
}

#[tokio::test]
async fn test_ten_megabyte_scenario() {
    let dir = TempDir::new().unwrap();
    let config = CoordinatorConfig {
        data_dir: dir.path().to_path_buf(),
        chunk_size: 4_194_304,
        virtual_nodes: 64,
        ..Default::default()
    };
    let coordinator = Coordinator::open(config, Arc::new(ManualClock::new())).unwrap();
    for id in ["n1", "n2", "n3"] {
        coordinator.register_store(id, Arc::new(MemoryChunkStore::new(id)));
        coordinator
            .heartbeat(distsync::common::HeartbeatRequest {
                node_id: id.into(),
                address: None,
                capacity_bytes: 0,
                used_bytes: 0,
                chunk_count: 0,
            })
            .await
            .unwrap();
    }

    let data = vec![0x41u8; 10_000_000];
    let record = coordinator
        .upload("big.bin", body(&data, 64 * 1024), UploadOptions::default())
        .await
        .unwrap();

    let sizes: Vec<u64> = record.chunks.iter().map(|c| c.size).collect();
    assert_eq!(sizes, vec![4_194_304, 4_194_304, 1_611_392]);
    assert_eq!(record.total_size, 10_000_000);

    let downloaded = coordinator
        .download("big.bin")
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap();
    assert_eq!(Sha256::digest(&downloaded), Sha256::digest(&data));
}

#[tokio::test]
async fn test_list_and_delete() {
    let cluster = Cluster::start_with(3, |c| c.gc_grace_ms = 0).await;
    cluster.upload("b.bin", b"bbbbbb").await.unwrap();
    cluster.upload("a.bin", b"aa").await.unwrap();

    let names: Vec<String> = cluster
        .coordinator
        .files()
        .iter()
        .map(|r| r.filename.clone())
        .collect();
    assert_eq!(names, vec!["a.bin", "b.bin"]);

    cluster.coordinator.delete("b.bin").await.unwrap();
    assert!(matches!(
        cluster.download("b.bin").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        cluster.coordinator.delete("b.bin").await,
        Err(Error::NotFound(_))
    ));

    // Only a.bin's single chunk survives collection, on two replicas
    settle().await;
    assert_eq!(cluster.object_count(), 2);
    assert_eq!(cluster.download("a.bin").await.unwrap().as_ref(), b"aa");
}

#[tokio::test]
async fn test_invalid_filename_rejected() {
    let cluster = Cluster::start(2).await;
    assert!(matches!(
        cluster.upload("", b"x").await,
        Err(Error::InvalidFilename(_))
    ));
    assert!(matches!(
        cluster.upload("bad\nname", b"x").await,
        Err(Error::InvalidFilename(_))
    ));
}

#[tokio::test]
async fn test_metrics_track_transfers() {
    let cluster = Cluster::start(2).await;
    cluster.upload("m.bin", b"123456789").await.unwrap();
    cluster.download("m.bin").await.unwrap();

    let metrics = cluster.coordinator.metrics();
    assert_eq!(metrics.uploads_total.get(), 1);
    assert_eq!(metrics.bytes_uploaded.get(), 9);
    assert_eq!(metrics.downloads_total.get(), 1);
    assert_eq!(metrics.bytes_downloaded.get(), 9);
    assert_eq!(metrics.chunks_written.get(), 6);
    assert!(metrics.to_prometheus().contains("uploads_total"));
}
