//! Access to chunk bytes held by storage nodes
//!
//! The coordinator only needs three operations from a node: store, fetch
//! and delete an object by key. [`HttpChunkStore`] speaks the node agent's
//! HTTP API; [`MemoryChunkStore`] keeps objects in memory and can be told
//! to fail, stall or corrupt data.

use crate::common::{encode_key, Error, NodeId, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Object storage capability of one storage node
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn store(&self, key: &str, data: Bytes) -> Result<()>;

    /// Returns `ChunkMissing` when the node does not hold `key`.
    async fn fetch(&self, key: &str) -> Result<Bytes>;

    /// Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Client for a storage node's `/chunks/{key}` endpoints
pub struct HttpChunkStore {
    node_id: NodeId,
    base_url: String,
    client: reqwest::Client,
}

impl HttpChunkStore {
    pub fn new(node_id: impl Into<NodeId>, address: &str, client: reqwest::Client) -> Self {
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        Self {
            node_id: node_id.into(),
            base_url,
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, key: &str) -> String {
        format!("{}/chunks/{}", self.base_url, encode_key(key))
    }

    fn write_error(&self, reason: impl ToString) -> Error {
        Error::ReplicaWrite {
            node: self.node_id.clone(),
            reason: reason.to_string(),
        }
    }

    fn read_error(&self, reason: impl ToString) -> Error {
        Error::ReplicaRead {
            node: self.node_id.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl ChunkStore for HttpChunkStore {
    async fn store(&self, key: &str, data: Bytes) -> Result<()> {
        let resp = self
            .client
            .put(self.url(key))
            .body(data)
            .send()
            .await
            .map_err(|e| self.write_error(e))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(self.write_error(format!("HTTP {}: {}", status, body)))
    }

    async fn fetch(&self, key: &str) -> Result<Bytes> {
        let resp = self
            .client
            .get(self.url(key))
            .send()
            .await
            .map_err(|e| self.read_error(e))?;

        match resp.status() {
            reqwest::StatusCode::NOT_FOUND => Err(Error::ChunkMissing {
                node: self.node_id.clone(),
            }),
            status if status.is_success() => resp.bytes().await.map_err(|e| self.read_error(e)),
            status => Err(self.read_error(format!("HTTP {}", status))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(key))
            .send()
            .await
            .map_err(|e| self.write_error(e))?;

        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(self.write_error(format!("delete returned HTTP {}", status)))
        }
    }
}

/// In-memory node with fault injection
pub struct MemoryChunkStore {
    node_id: NodeId,
    objects: RwLock<HashMap<String, Bytes>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
    stores: AtomicU64,
    fetches: AtomicU64,
}

impl MemoryChunkStore {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            objects: RwLock::new(HashMap::new()),
            failing: AtomicBool::new(false),
            delay: Mutex::new(None),
            stores: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Make every operation fail (a live node with a broken disk).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stall every operation before it runs.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Flip a byte of a stored object. Returns false if it is absent or empty.
    pub fn corrupt(&self, key: &str) -> bool {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        match objects.get_mut(key) {
            Some(data) if !data.is_empty() => {
                let mut bytes = data.to_vec();
                bytes[0] ^= 0xff;
                *data = Bytes::from(bytes);
                true
            }
            _ => false,
        }
    }

    /// Drop an object behind the coordinator's back.
    pub fn forget(&self, key: &str) -> bool {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful and failed store calls seen so far
    pub fn store_calls(&self) -> u64 {
        self.stores.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_failing(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::ReplicaWrite {
                node: self.node_id.clone(),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn store(&self, key: &str, data: Bytes) -> Result<()> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_failing()?;
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::ReplicaRead {
                node: self.node_id.clone(),
                reason: "injected failure".into(),
            });
        }
        self.get(key).ok_or_else(|| Error::ChunkMissing {
            node: self.node_id.clone(),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.pause().await;
        self.check_failing()?;
        self.forget(key);
        Ok(())
    }
}

struct Registered {
    store: Arc<dyn ChunkStore>,
    address: Option<String>,
}

/// NodeId -> chunk store handle
pub struct NodeRegistry {
    stores: RwLock<HashMap<NodeId, Registered>>,
    client: reqwest::Client,
}

impl NodeRegistry {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self::with_client(client)
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            client,
        }
    }

    /// Point `node` at an HTTP address. Returns true if the handle changed.
    pub fn register_http(&self, node: &str, address: &str) -> bool {
        let mut stores = self.stores.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = stores.get(node) {
            if existing.address.as_deref() == Some(address) {
                return false;
            }
        }
        let store = HttpChunkStore::new(node, address, self.client.clone());
        stores.insert(
            node.to_string(),
            Registered {
                store: Arc::new(store),
                address: Some(address.to_string()),
            },
        );
        true
    }

    /// Register an arbitrary store, e.g. an in-process one.
    pub fn insert(&self, node: &str, store: Arc<dyn ChunkStore>) {
        self.stores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                node.to_string(),
                Registered {
                    store,
                    address: None,
                },
            );
    }

    pub fn get(&self, node: &str) -> Option<Arc<dyn ChunkStore>> {
        self.stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node)
            .map(|entry| entry.store.clone())
    }

    /// Like [`NodeRegistry::get`], but an unknown node is a replica failure.
    pub fn require(&self, node: &str) -> Result<Arc<dyn ChunkStore>> {
        self.get(node).ok_or_else(|| Error::ReplicaWrite {
            node: node.to_string(),
            reason: "no address registered".into(),
        })
    }

    pub fn address(&self, node: &str) -> Option<String> {
        self.stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node)
            .and_then(|entry| entry.address.clone())
    }

    pub fn remove(&self, node: &str) -> bool {
        self.stores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node)
            .is_some()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryChunkStore::new("n1");
        store.store("k", Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(store.fetch("k").await.unwrap(), Bytes::from_static(b"hello"));

        store.delete("k").await.unwrap();
        assert!(matches!(
            store.fetch("k").await,
            Err(Error::ChunkMissing { .. })
        ));
        // Deleting again is fine
        store.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_faults() {
        let store = MemoryChunkStore::new("n1");
        store.store("k", Bytes::from_static(b"abc")).await.unwrap();

        assert!(store.corrupt("k"));
        assert_ne!(store.fetch("k").await.unwrap(), Bytes::from_static(b"abc"));

        store.set_failing(true);
        let err = store.store("k2", Bytes::new()).await.unwrap_err();
        assert!(err.is_replica_failure());
        assert!(!store.contains("k2"));
        assert_eq!(store.store_calls(), 2);
    }

    #[test]
    fn test_http_store_url() {
        let store = HttpChunkStore::new("n1", "127.0.0.1:6000/", reqwest::Client::new());
        assert_eq!(store.base_url(), "http://127.0.0.1:6000");
        assert_eq!(store.url("abc.def"), "http://127.0.0.1:6000/chunks/abc.def");
    }

    #[test]
    fn test_registry_reregistration() {
        let registry = NodeRegistry::new();
        assert!(registry.register_http("n1", "http://a:1"));
        assert!(!registry.register_http("n1", "http://a:1"));
        assert!(registry.register_http("n1", "http://b:1"));
        assert_eq!(registry.address("n1").as_deref(), Some("http://b:1"));

        registry.insert("n2", Arc::new(MemoryChunkStore::new("n2")));
        assert!(registry.get("n2").is_some());
        assert!(registry.address("n2").is_none());

        assert!(registry.remove("n1"));
        assert!(registry.require("n1").is_err());
    }
}
