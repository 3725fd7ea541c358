//! Configuration module for Waypost.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for push ingress (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "waypost.db")
    pub db_path: String,
    /// Seconds between heartbeat sweeps (default: 30)
    pub sweep_interval_secs: u64,
    /// Per-channel notification delivery timeout in seconds (default: 10)
    pub delivery_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "waypost.db".to_string(),
            sweep_interval_secs: 30,
            delivery_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `WAYPOST_HTTP_PORT`: HTTP port (default: 8080)
    /// - `WAYPOST_DB_PATH`: Database file path (default: "waypost.db")
    /// - `WAYPOST_SWEEP_INTERVAL`: Heartbeat sweep interval, seconds (default: 30)
    /// - `WAYPOST_DELIVERY_TIMEOUT`: Delivery timeout, seconds (default: 10)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parsed(&lookup, "WAYPOST_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("WAYPOST_DB_PATH").filter(|p| !p.is_empty()) {
            cfg.db_path = db_path;
        }

        if let Some(secs) = parsed::<u64>(&lookup, "WAYPOST_SWEEP_INTERVAL").filter(|s| *s > 0) {
            cfg.sweep_interval_secs = secs;
        }

        if let Some(secs) = parsed::<u64>(&lookup, "WAYPOST_DELIVERY_TIMEOUT").filter(|s| *s > 0) {
            cfg.delivery_timeout_secs = secs;
        }

        cfg
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
