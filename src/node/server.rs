//! Storage node server

use crate::common::{shutdown_signal, NodeConfig, Result};
use crate::node::heartbeat::HeartbeatTask;
use crate::node::http::{create_router, AgentState};
use crate::node::store::LocalChunkStore;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct NodeServer {
    config: NodeConfig,
}

impl NodeServer {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Bind the configured address and serve until Ctrl-C.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    ///
    /// Without an explicit `advertise_url` the node advertises the
    /// listener's actual address.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        self.config.validate()?;
        let local_addr = listener.local_addr()?;
        let address = self
            .config
            .advertise_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", local_addr));

        tracing::info!("Starting storage node: {}", self.config.node_id);
        tracing::info!("  HTTP API: {} (advertised as {})", local_addr, address);
        tracing::info!("  Data dir: {}", self.config.data_dir.display());
        tracing::info!("  Coordinator: {}", self.config.coordinator_url);

        let store = Arc::new(LocalChunkStore::open(
            self.config.node_id.clone(),
            &self.config.data_dir,
            self.config.capacity_bytes,
        )?);

        let heartbeat = HeartbeatTask::new(
            &self.config.coordinator_url,
            address,
            self.config.heartbeat_interval(),
            store.clone(),
        )
        .start();

        let router = create_router(AgentState { store }, self.config.max_chunk_bytes);

        tracing::info!("✓ Storage node ready");

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;
        heartbeat.abort();

        if let Err(e) = served {
            tracing::error!("HTTP server error: {}", e);
            return Err(e.into());
        }
        tracing::info!("Storage node stopped");
        Ok(())
    }
}
