//! Pattern registration for the store adapter

use std::sync::Arc;

use tracing::{info, warn};

use docstore_bus::Router;
use docstore_common::config::AdapterConfig;
use docstore_common::driver::Driver;
use docstore_common::error::Result;

use crate::handlers::StoreService;

/// Every `cmd` the adapter answers under its topic
pub const COMMANDS: [&str; 17] = [
    "createDatabase",
    "removeDatabase",
    "createTable",
    "removeTable",
    "truncateTable",
    "changes",
    "create",
    "update",
    "updateById",
    "remove",
    "removeById",
    "replace",
    "replaceById",
    "findById",
    "count",
    "exists",
    "find",
];

/// Binds the store commands to a router
pub struct StorePlugin {
    service: Arc<StoreService>,
}

impl StorePlugin {
    pub fn new(driver: Arc<dyn Driver>, config: AdapterConfig) -> Self {
        Self {
            service: Arc::new(StoreService::new(driver, config)),
        }
    }

    pub fn service(&self) -> Arc<StoreService> {
        self.service.clone()
    }

    /// Register every command under the configured topic, plus a close hook
    /// that releases the driver
    pub fn register(&self, router: &Router) -> Result<()> {
        let topic = self.service.config().topic.clone();
        for cmd in COMMANDS {
            router.add(&topic, cmd, self.service.clone())?;
        }

        let driver = self.service.driver();
        router.on_close(move || async move {
            info!("Closing store driver");
            if let Err(e) = driver.close().await {
                warn!("Failed to close store driver: {}", e);
            }
        });

        info!("Registered {} store patterns under topic {}", COMMANDS.len(), topic);
        Ok(())
    }
}
