//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use conduit_settings::ServerSettings;

/// Configuration for the Conduit gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent viewer connections.
    pub max_connections: usize,
    /// Seconds between ping frames.
    pub heartbeat_interval_secs: u64,
    /// Seconds without inbound activity before a viewer is dropped.
    pub heartbeat_timeout_secs: u64,
    /// Outbound queue depth per viewer; overflow is dropped.
    pub send_queue_capacity: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 64,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            send_queue_capacity: 1024,
            max_message_size: 4 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Build from the `server` section of the settings file.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_connections: settings.max_connections,
            heartbeat_interval_secs: settings.heartbeat_interval_secs,
            heartbeat_timeout_secs: settings.heartbeat_timeout_secs,
            send_queue_capacity: settings.send_queue_capacity,
            ..Self::default()
        }
    }

    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Ping period. Never zero.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Inactivity limit. Never shorter than one ping period.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs).max(self.heartbeat_interval())
    }
}
