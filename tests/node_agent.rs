//! Storage node agent over real HTTP

use bytes::Bytes;
use distsync::common::{NodeConfig, NodeStats};
use distsync::coordinator::{ChunkStore, HttpChunkStore};
use distsync::{Error, NodeServer};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct Agent {
    url: String,
    _dir: TempDir,
    _shutdown: oneshot::Sender<()>,
}

async fn start_agent(capacity_bytes: u64) -> Agent {
    let dir = TempDir::new().unwrap();
    let config = NodeConfig {
        node_id: "n1".into(),
        // Nothing listens here; heartbeat failures are only logged
        coordinator_url: "http://127.0.0.1:9".into(),
        data_dir: dir.path().to_path_buf(),
        capacity_bytes,
        heartbeat_interval_ms: 1_000,
        ..Default::default()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(NodeServer::new(config).run(listener, async move {
        let _ = rx.await;
    }));

    Agent {
        url,
        _dir: dir,
        _shutdown: tx,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_store_fetch_delete() {
    let agent = start_agent(0).await;
    let store = HttpChunkStore::new("n1", &agent.url, reqwest::Client::new());

    store
        .store("file/with spaces:0.abc", Bytes::from_static(b"chunk bytes"))
        .await
        .unwrap();
    assert_eq!(
        store.fetch("file/with spaces:0.abc").await.unwrap().as_ref(),
        b"chunk bytes"
    );

    let stats: NodeStats = reqwest::get(format!("{}/stats", agent.url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats.node_id, "n1");
    assert_eq!(stats.chunks, 1);
    assert_eq!(stats.used_bytes, 11);

    store.delete("file/with spaces:0.abc").await.unwrap();
    assert!(matches!(
        store.fetch("file/with spaces:0.abc").await,
        Err(Error::ChunkMissing { .. })
    ));
    // Deleting twice is fine
    store.delete("file/with spaces:0.abc").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_capacity_rejects_write() {
    let agent = start_agent(16).await;
    let store = HttpChunkStore::new("n1", &agent.url, reqwest::Client::new());

    store.store("a", Bytes::from(vec![0u8; 10])).await.unwrap();
    let err = store
        .store("b", Bytes::from(vec![0u8; 10]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReplicaWrite { .. }));
    assert!(err.is_replica_failure());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health() {
    let agent = start_agent(0).await;
    let body: serde_json::Value = reqwest::get(format!("{}/health", agent.url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["node_id"], "n1");
}
