//! Configuration management for docstore

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Main configuration structure for docstore
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Bus server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Store adapter configuration
    #[serde(default)]
    pub adapter: AdapterConfig,

    /// Metrics exporter configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML/JSON file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse(&content, path.as_ref().extension().map_or(false, |ext| ext == "toml"))
    }

    /// Parse configuration text, TOML when `toml` is set and JSON otherwise
    pub fn parse(content: &str, toml: bool) -> Result<Self> {
        let config: Config = if toml {
            toml::from_str(content)
                .map_err(|e| Error::Config(format!("Failed to parse TOML config: {}", e)))?
        } else {
            serde_json::from_str(content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the components cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.adapter.topic.is_empty() {
            return Err(Error::Config("adapter.topic must not be empty".to_string()));
        }
        if self.adapter.default_database.is_empty() {
            return Err(Error::Config(
                "adapter.default_database must not be empty".to_string(),
            ));
        }
        if self.storage.path.is_none() && !self.storage.temporary {
            return Err(Error::Config(
                "storage.path is required unless storage.temporary is set".to_string(),
            ));
        }
        if self.storage.feed_buffer == 0 {
            return Err(Error::Config("storage.feed_buffer must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bus port
    pub port: u16,
    /// Maximum size of a single bus frame in bytes
    pub max_frame_length: usize,
    /// Outbound frames buffered per connection
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4222,
            max_frame_length: 8 * 1024 * 1024, // 8MB
            outbound_buffer: 1024,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to storage directory
    pub path: Option<String>,
    /// Keep data in a temporary directory removed on close
    pub temporary: bool,
    /// Page cache capacity in bytes
    pub cache_capacity_bytes: u64,
    /// Background flush interval in milliseconds (none = flush on close only)
    pub flush_every_ms: Option<u64>,
    /// Change events buffered per table before slow feeds lag
    pub feed_buffer: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: Some("./data".to_string()),
            temporary: false,
            cache_capacity_bytes: 256 * 1024 * 1024, // 256MB
            flush_every_ms: Some(500),
            feed_buffer: 1024,
        }
    }
}

impl StorageConfig {
    /// In-memory style configuration backed by a temporary directory
    pub fn temporary() -> Self {
        Self {
            path: None,
            temporary: true,
            flush_every_ms: None,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Topic every store pattern is registered under
    pub topic: String,
    /// Database used when a request omits `databaseName`
    pub default_database: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            topic: "docstore".to_string(),
            default_database: "test".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    pub enabled: bool,
    /// Exporter port
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9464,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON log lines
    pub json: bool,
}
