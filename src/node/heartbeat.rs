//! Periodic heartbeat to the coordinator
//!
//! A node never deregisters. It reports in every `heartbeat_interval` and
//! the coordinator derives liveness from how recently it heard from it.

use crate::common::{Error, ErrorBody, HeartbeatAck, HeartbeatRequest, Result};
use crate::node::store::LocalChunkStore;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct HeartbeatTask {
    client: reqwest::Client,
    endpoint: String,
    address: String,
    interval: Duration,
    store: Arc<LocalChunkStore>,
}

impl HeartbeatTask {
    pub fn new(
        coordinator_url: &str,
        address: String,
        interval: Duration,
        store: Arc<LocalChunkStore>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(interval.max(Duration::from_secs(1)))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: format!("{}/nodes/heartbeat", coordinator_url.trim_end_matches('/')),
            address,
            interval,
            store,
        }
    }

    fn request(&self) -> HeartbeatRequest {
        let stats = self.store.stats();
        HeartbeatRequest {
            node_id: stats.node_id,
            address: Some(self.address.clone()),
            capacity_bytes: stats.capacity_bytes,
            used_bytes: stats.used_bytes,
            chunk_count: stats.chunks,
        }
    }

    pub async fn send_once(&self) -> Result<HeartbeatAck> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&self.request())
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(match resp.json::<ErrorBody>().await {
                Ok(body) => Error::from_body(body),
                Err(_) => Error::Http(format!("heartbeat rejected with HTTP {}", status)),
            });
        }
        Ok(resp.json().await?)
    }

    /// Heartbeat until the task is aborted.
    pub fn start(self) -> JoinHandle<()> {
        // Spread nodes started together across the interval
        let jitter_ms = rand::thread_rng().gen_range(0..=self.interval.as_millis() as u64 / 4);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            let mut failures = 0u32;
            loop {
                match self.send_once().await {
                    Ok(ack) => {
                        if failures > 0 || ack.rejoined {
                            tracing::info!(rejoined = ack.rejoined, "registered with coordinator");
                        }
                        failures = 0;
                    }
                    Err(e) => {
                        failures += 1;
                        // Log the first failure and then every tenth
                        if failures == 1 || failures % 10 == 0 {
                            tracing::warn!(failures, error = %e, "heartbeat failed");
                        }
                    }
                }
                tokio::time::sleep(self.interval).await;
            }
        })
    }
}
