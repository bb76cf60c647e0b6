//! Coordinator server

use crate::common::{shutdown_signal, CoordinatorConfig, Result, SystemClock};
use crate::coordinator::http::{create_router, CoordState};
use crate::coordinator::monitor::LivenessMonitor;
use crate::coordinator::service::Coordinator;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct CoordinatorServer {
    config: CoordinatorConfig,
}

impl CoordinatorServer {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config }
    }

    /// Bind the configured address and serve until Ctrl-C.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let coordinator = Coordinator::open(self.config, Arc::new(SystemClock))?;
        Self::run(coordinator, listener, shutdown_signal()).await
    }

    /// Serve `coordinator` on an already bound listener until `shutdown`
    /// resolves.
    pub async fn run(
        coordinator: Coordinator,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let config = coordinator.config();
        tracing::info!("Starting coordinator");
        tracing::info!("  HTTP API: {}", listener.local_addr()?);
        tracing::info!("  Data dir: {}", config.data_dir.display());
        tracing::info!(
            "  Replicas: {} (write quorum {})",
            config.replicas,
            config.write_quorum()
        );
        tracing::info!("  Chunk size: {} bytes", config.chunk_size);

        let monitor = LivenessMonitor::new(coordinator.clone()).start();
        let router = create_router(CoordState { coordinator });

        tracing::info!("✓ Coordinator ready");

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;
        monitor.abort();

        if let Err(e) = served {
            tracing::error!("HTTP server error: {}", e);
            return Err(e.into());
        }
        tracing::info!("Coordinator stopped");
        Ok(())
    }
}
