//! Write quorum, failure atomicity and re-upload visibility

mod support;

use distsync::coordinator::UploadOptions;
use distsync::Error;
use std::time::Duration;
use support::{body, settle, Cluster};

#[tokio::test]
async fn test_quorum_below_replicas_accepts_partial_acks() {
    let cluster = Cluster::start_with(3, |c| {
        c.replicas = 3;
        c.write_quorum = Some(2);
    })
    .await;
    cluster.node("n3").set_failing(true);

    let record = cluster.upload("w2.bin", b"abcdefgh").await.unwrap();
    for chunk in &record.chunks {
        assert_eq!(chunk.replicas.len(), 2);
        assert!(!chunk.replicas.contains(&"n3".to_string()));
    }
    assert_eq!(cluster.download("w2.bin").await.unwrap().as_ref(), b"abcdefgh");
    assert_eq!(cluster.coordinator.cluster_status().under_replicated_chunks, 2);
}

#[tokio::test]
async fn test_failed_upload_leaves_no_trace() {
    let cluster = Cluster::start(3).await;
    cluster.node("n2").set_failing(true);
    cluster.node("n3").set_failing(true);

    let err = cluster.upload("atomic.bin", &[5u8; 20]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InsufficientReplicas {
            needed: 2,
            available: 1,
            ..
        }
    ));
    assert!(cluster.coordinator.metadata().get("atomic.bin").is_none());
    // Whatever reached the healthy node was cleaned up
    assert!(cluster.node("n1").is_empty());
    assert_eq!(cluster.coordinator.metrics().uploads_failed.get(), 1);
}

#[tokio::test]
async fn test_failed_reupload_keeps_previous_version() {
    let cluster = Cluster::start(3).await;
    let v1 = cluster.upload("keep.bin", b"version one").await.unwrap();

    for node in cluster.nodes.values() {
        node.set_failing(true);
    }
    assert!(cluster.upload("keep.bin", b"version two!").await.is_err());
    for node in cluster.nodes.values() {
        node.set_failing(false);
    }

    let current = cluster.coordinator.file("keep.bin").unwrap();
    assert_eq!(current.checksum, v1.checksum);
    assert_eq!(
        cluster.download("keep.bin").await.unwrap().as_ref(),
        b"version one"
    );
}

#[tokio::test]
async fn test_reupload_replaces_and_collects_old_chunks() {
    let cluster = Cluster::start_with(3, |c| c.gc_grace_ms = 0).await;
    let v1 = cluster.upload("doc.txt", b"aaaaaaaa").await.unwrap();
    let v2 = cluster.upload("doc.txt", b"bbbb").await.unwrap();
    assert_ne!(v1.checksum, v2.checksum);

    settle().await;
    assert_eq!(cluster.download("doc.txt").await.unwrap().as_ref(), b"bbbb");
    // Only v2's single chunk remains, on two nodes
    assert_eq!(cluster.object_count(), 2);
    for chunk in &v1.chunks {
        for node in &chunk.replicas {
            assert!(!cluster.node(node).contains(&chunk.object_key()));
        }
    }
}

#[tokio::test]
async fn test_identical_reupload_keeps_shared_objects() {
    let cluster = Cluster::start_with(3, |c| c.gc_grace_ms = 0).await;
    cluster.upload("same.bin", b"12345678").await.unwrap();
    cluster.upload("same.bin", b"12345678").await.unwrap();

    settle().await;
    assert_eq!(
        cluster.download("same.bin").await.unwrap().as_ref(),
        b"12345678"
    );
}

#[tokio::test]
async fn test_download_in_progress_sees_old_version() {
    let cluster = Cluster::start(3).await;
    cluster.upload("v.bin", b"old old old!").await.unwrap();

    let download = cluster.coordinator.download("v.bin").await.unwrap();
    cluster.upload("v.bin", b"new new new!").await.unwrap();

    assert_eq!(download.read_to_end().await.unwrap().as_ref(), b"old old old!");
    assert_eq!(
        cluster.download("v.bin").await.unwrap().as_ref(),
        b"new new new!"
    );
}

#[tokio::test]
async fn test_concurrent_uploads_to_one_name_serialize() {
    let cluster = Cluster::start(3).await;
    let a = vec![b'a'; 30];
    let b = vec![b'b'; 30];

    let (ra, rb) = tokio::join!(
        cluster.upload("race.bin", &a),
        cluster.upload("race.bin", &b)
    );
    ra.unwrap();
    rb.unwrap();

    let current = cluster.coordinator.file("race.bin").unwrap();
    let data = cluster.download("race.bin").await.unwrap();
    assert!(data == a || data == b);
    assert_eq!(distsync::common::blake3_hash(&data), current.checksum);
}

#[tokio::test]
async fn test_under_replication_is_opt_in() {
    let strict = Cluster::start_with(1, |c| c.write_quorum = Some(1)).await;
    assert!(matches!(
        strict.upload("u.bin", b"x").await,
        Err(Error::InsufficientReplicas { .. })
    ));

    let relaxed = Cluster::start_with(1, |c| {
        c.write_quorum = Some(1);
        c.allow_under_replication = true;
    })
    .await;
    let record = relaxed.upload("u.bin", b"x").await.unwrap();
    assert_eq!(record.chunks[0].replicas, vec!["n1".to_string()]);
}

#[tokio::test]
async fn test_deadline_aborts_without_commit() {
    let cluster = Cluster::start(2).await;
    for node in cluster.nodes.values() {
        node.set_delay(Some(Duration::from_millis(500)));
    }

    let err = cluster
        .coordinator
        .upload(
            "late.bin",
            body(b"abcdefgh", 4),
            UploadOptions::default().with_deadline(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(cluster.coordinator.metadata().get("late.bin").is_none());
}
