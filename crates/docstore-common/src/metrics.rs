//! Metrics and observability for docstore
#![allow(clippy::cast_precision_loss)]

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::config::MetricsConfig;
use crate::error::{Error, Result};

/// Install the Prometheus exporter when enabled
///
/// Must be called from within a tokio runtime.
pub fn install_exporter(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| Error::Config(format!("Failed to install metrics exporter: {}", e)))?;

    info!("Prometheus metrics exporter listening on {}", addr);
    Ok(())
}

// ============================================================================
// Command Metrics
// ============================================================================

/// Record a handled command
pub fn record_command(cmd: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("docstore_commands_total",
        "cmd" => cmd.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record command latency
pub fn record_command_latency(cmd: &str, latency_ms: f64) {
    histogram!("docstore_command_duration_ms", "cmd" => cmd.to_string()).record(latency_ms);
}

/// Record a request that matched no pattern
pub fn record_unmatched() {
    counter!("docstore_unmatched_patterns_total").increment(1);
}

// ============================================================================
// Subscription Metrics
// ============================================================================

pub fn subscription_opened() {
    gauge!("docstore_active_subscriptions").increment(1.0);
}

pub fn subscription_closed() {
    gauge!("docstore_active_subscriptions").decrement(1.0);
}

/// Record a change event delivered to a subscriber
pub fn record_change_delivered() {
    counter!("docstore_change_events_total").increment(1);
}

// ============================================================================
// Connection Metrics
// ============================================================================

pub fn connection_opened() {
    counter!("docstore_connections_total").increment(1);
    gauge!("docstore_active_connections").increment(1.0);
}

pub fn connection_closed() {
    gauge!("docstore_active_connections").decrement(1.0);
}

/// Timer guard recording command latency on drop
pub struct CommandTimer {
    start: Instant,
    cmd: String,
}

impl CommandTimer {
    #[must_use]
    pub fn new(cmd: &str) -> Self {
        Self {
            start: Instant::now(),
            cmd: cmd.to_string(),
        }
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for CommandTimer {
    fn drop(&mut self) {
        record_command_latency(&self.cmd, self.elapsed_ms());
    }
}
