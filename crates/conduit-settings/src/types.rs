//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a partial user file only needs to
//! name the keys it changes.

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConduitSettings {
    /// HTTP / WebSocket listener.
    pub server: ServerSettings,
    /// Agent CLI invocation.
    pub agent: AgentSettings,
    /// Persistent worker pool.
    pub pool: PoolSettings,
    /// Event demultiplexing limits.
    pub stream: StreamSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// Server network and viewer-liveness settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Seconds between ping frames sent to each viewer.
    pub heartbeat_interval_secs: u64,
    /// Seconds without inbound activity before a viewer is dropped.
    pub heartbeat_timeout_secs: u64,
    /// Maximum number of concurrent viewer connections.
    pub max_connections: usize,
    /// Outbound queue depth per viewer.
    pub send_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            max_connections: 64,
            send_queue_capacity: 1024,
        }
    }
}

/// How the agent CLI authenticates upstream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Inject the configured API key and base URL.
    #[default]
    ApiKey,
    /// The CLI uses its own stored login; inject nothing.
    Oauth,
}

/// Agent CLI invocation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Executable name or path.
    pub binary: String,
    /// Arguments placed before the agent flags (e.g. a script for a wrapper).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub binary_args: Vec<String>,
    /// Model passed via `--model`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Authentication mode.
    pub auth_mode: AuthMode,
    /// API key injected as `ANTHROPIC_API_KEY`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Upstream base URL injected as `ANTHROPIC_BASE_URL`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Metering proxy that replaces the base URL when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metering_proxy_url: Option<String>,
    /// System prompt passed via `--system-prompt`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Spend ceiling passed via `--max-budget-usd`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    /// Working directory for sessions that do not name one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_work_dir: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            binary_args: Vec::new(),
            model: None,
            auth_mode: AuthMode::default(),
            api_key: None,
            base_url: None,
            metering_proxy_url: None,
            system_prompt: None,
            max_budget_usd: None,
            default_work_dir: None,
        }
    }
}

/// Persistent worker pool settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolSettings {
    /// When false every turn uses a one-shot invocation.
    pub enabled: bool,
    /// Seconds a worker may stay idle before the reaper removes it.
    pub idle_timeout_secs: u64,
    /// Seconds between reaper sweeps.
    pub reap_interval_secs: u64,
    /// Buffered output lines per worker.
    pub line_buffer: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_timeout_secs: 1800,
            reap_interval_secs: 300,
            line_buffer: 256,
        }
    }
}

/// Limits applied while demultiplexing agent output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Characters of reasoning text kept for the persisted summary.
    pub thinking_summary_chars: usize,
    /// Characters of tool arguments kept per step record.
    pub step_input_chars: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            thinking_summary_chars: 500,
            step_input_chars: 1000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = ConduitSettings::default();
        assert_eq!(s.server.port, 8080);
        assert_eq!(s.server.heartbeat_interval_secs, 30);
        assert_eq!(s.server.heartbeat_timeout_secs, 60);
        assert_eq!(s.agent.binary, "claude");
        assert_eq!(s.agent.auth_mode, AuthMode::ApiKey);
        assert!(s.pool.enabled);
        assert_eq!(s.pool.idle_timeout_secs, 1800);
        assert_eq!(s.pool.reap_interval_secs, 300);
        assert_eq!(s.stream.thinking_summary_chars, 500);
        assert_eq!(s.stream.step_input_chars, 1000);
    }

    #[test]
    fn camel_case_keys() {
        let value = serde_json::to_value(ConduitSettings::default()).unwrap();
        assert!(value["server"]["heartbeatIntervalSecs"].is_number());
        assert!(value["pool"]["idleTimeoutSecs"].is_number());
        assert_eq!(value["agent"]["authMode"], "api_key");
        assert!(value["agent"].get("apiKey").is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: ConduitSettings =
            serde_json::from_str(r#"{"agent": {"authMode": "oauth"}}"#).unwrap();
        assert_eq!(s.agent.auth_mode, AuthMode::Oauth);
        assert_eq!(s.agent.binary, "claude");
        assert_eq!(s.server.port, 8080);
    }
}
