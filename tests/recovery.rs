//! Coordinator restart: metadata and ring membership come back from disk

mod support;

use distsync::common::{HeartbeatRequest, ManualClock, NodeState};
use distsync::coordinator::MetadataStore;
use distsync::{Coordinator, Error};
use std::sync::Arc;
use support::{test_config, Cluster};

fn beat(id: &str) -> HeartbeatRequest {
    HeartbeatRequest {
        node_id: id.to_string(),
        address: None,
        capacity_bytes: 0,
        used_bytes: 0,
        chunk_count: 0,
    }
}

#[tokio::test]
async fn test_files_survive_restart() {
    let cluster = Cluster::start(3).await;
    let record = cluster.upload("persist.bin", b"durable bytes").await.unwrap();

    let reopened =
        Coordinator::open(test_config(&cluster.dir), Arc::new(ManualClock::new())).unwrap();
    for (id, store) in &cluster.nodes {
        reopened.register_store(id, store.clone());
    }

    let restored = reopened.file("persist.bin").unwrap();
    assert_eq!(restored.as_ref(), record.as_ref());
    assert_eq!(reopened.placement().ring_nodes(), vec!["n1", "n2", "n3"]);

    // On the ring but not live until they report in
    let status = reopened.cluster_status();
    assert_eq!(status.live_nodes, 0);
    assert!(status.nodes.iter().all(|n| n.state == NodeState::Dead));
    let err = reopened
        .download("persist.bin")
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReplicaExhausted { chunk: 0 }));

    for id in cluster.nodes.keys() {
        reopened.heartbeat(beat(id)).await.unwrap();
    }
    let data = reopened
        .download("persist.bin")
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap();
    assert_eq!(data.as_ref(), b"durable bytes");
}

#[tokio::test]
async fn test_delete_survives_restart() {
    let cluster = Cluster::start(2).await;
    cluster.upload("a.bin", b"a").await.unwrap();
    cluster.upload("b.bin", b"b").await.unwrap();
    cluster.coordinator.delete("a.bin").await.unwrap();

    let store = MetadataStore::open(cluster.dir.path()).unwrap();
    assert!(store.get("a.bin").is_none());
    assert!(store.get("b.bin").is_some());
    assert_eq!(store.file_count(), 1);
}

#[tokio::test]
async fn test_decommission_survives_restart() {
    let cluster = Cluster::start(3).await;
    cluster.coordinator.decommission("n2").await.unwrap();

    let reopened =
        Coordinator::open(test_config(&cluster.dir), Arc::new(ManualClock::new())).unwrap();
    assert_eq!(reopened.placement().ring_nodes(), vec!["n1", "n3"]);
}

#[tokio::test]
async fn test_corrupt_metadata_starts_empty() {
    let cluster = Cluster::start(2).await;
    cluster.upload("x.bin", b"x").await.unwrap();

    let path = cluster.dir.path().join("metadata.json");
    std::fs::write(&path, b"{ not json").unwrap();

    let store = MetadataStore::open(cluster.dir.path()).unwrap();
    assert_eq!(store.file_count(), 0);
    assert!(store.nodes().is_empty());
    assert!(cluster.dir.path().join("metadata.json.corrupt").exists());

    // The empty store is usable and persists again
    let reopened =
        Coordinator::open(test_config(&cluster.dir), Arc::new(ManualClock::new())).unwrap();
    assert!(reopened.files().is_empty());
    assert!(matches!(reopened.file("x.bin"), Err(Error::NotFound(_))));
}
