//! Server orchestration

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use docstore_adapter::StorePlugin;
use docstore_bus::{BusServer, Router};
use docstore_common::config::Config;
use docstore_common::metrics;
use docstore_engine::StorageEngine;

/// docstore server: storage engine, store adapter and bus server
pub struct DocStoreServer {
    config: Config,
    storage: Arc<StorageEngine>,
    router: Arc<Router>,
    bus: BusServer,
}

impl DocStoreServer {
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing docstore components...");

        let storage = Arc::new(StorageEngine::new(&config.storage).await?);
        if storage.ensure_database(&config.adapter.default_database)? {
            info!("Created default database {}", config.adapter.default_database);
        }

        let router = Arc::new(Router::new());
        StorePlugin::new(storage.clone(), config.adapter.clone()).register(&router)?;

        let bus = BusServer::new(&config.server, router.clone());

        info!("docstore initialization complete");

        Ok(Self {
            config,
            storage,
            router,
            bus,
        })
    }

    /// Serve the bus until shutdown
    pub async fn run(&self) -> Result<()> {
        metrics::install_exporter(&self.config.metrics)?;

        let listener = TcpListener::bind(self.config.server.bind_address()).await?;
        info!(
            "docstore serving topic {} on {}",
            self.config.adapter.topic,
            listener.local_addr()?
        );
        if self.config.metrics.enabled {
            info!("Metrics available on port {}", self.config.metrics.port);
        }

        self.bus.serve(listener).await?;
        Ok(())
    }

    /// Graceful shutdown: stop the bus, then close the router (and with it the engine)
    pub async fn shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown...");

        self.bus.shutdown().await?;
        self.router.close().await;

        if self.storage.is_ready() {
            self.storage.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
