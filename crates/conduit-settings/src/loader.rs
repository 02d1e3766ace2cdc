//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ConduitSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `CONDUIT_*` environment variable overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{AuthMode, ConduitSettings};

/// Resolve the path to the settings file (`~/.conduit/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".conduit").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ConduitSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid combination of
/// values is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ConduitSettings> {
    let defaults = serde_json::to_value(ConduitSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ConduitSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are logged and ignored (the file/default value stays).
pub fn apply_env_overrides(settings: &mut ConduitSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("CONDUIT_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("CONDUIT_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_u64("CONDUIT_HEARTBEAT_INTERVAL_SECS", 1, 3600) {
        settings.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = read_env_u64("CONDUIT_HEARTBEAT_TIMEOUT_SECS", 1, 7200) {
        settings.server.heartbeat_timeout_secs = v;
    }

    // ── Agent ───────────────────────────────────────────────────────
    if let Some(v) = read_env_string("CONDUIT_AGENT_BINARY") {
        settings.agent.binary = v;
    }
    if let Some(v) = read_env_string("CONDUIT_MODEL") {
        settings.agent.model = Some(v);
    }
    if let Some(v) = read_env_string("CONDUIT_AUTH_MODE") {
        match parse_auth_mode(&v) {
            Some(mode) => settings.agent.auth_mode = mode,
            None => tracing::warn!(key = "CONDUIT_AUTH_MODE", value = %v, "invalid auth mode, ignoring"),
        }
    }
    if let Some(v) = read_env_string("CONDUIT_API_KEY") {
        settings.agent.api_key = Some(v);
    }
    if let Some(v) = read_env_string("CONDUIT_BASE_URL") {
        settings.agent.base_url = Some(v);
    }
    if let Some(v) = read_env_string("CONDUIT_METERING_PROXY_URL") {
        settings.agent.metering_proxy_url = Some(v);
    }
    if let Some(v) = read_env_string("CONDUIT_WORK_DIR") {
        settings.agent.default_work_dir = Some(v);
    }

    // ── Pool ────────────────────────────────────────────────────────
    if let Some(v) = read_env_bool("CONDUIT_POOL_ENABLED") {
        settings.pool.enabled = v;
    }
    if let Some(v) = read_env_u64("CONDUIT_IDLE_TIMEOUT_SECS", 1, 86_400) {
        settings.pool.idle_timeout_secs = v;
    }
    if let Some(v) = read_env_u64("CONDUIT_REAP_INTERVAL_SECS", 1, 86_400) {
        settings.pool.reap_interval_secs = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("CONDUIT_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("CONDUIT_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Check constraints that span more than one field.
pub fn validate(settings: &ConduitSettings) -> Result<()> {
    let server = &settings.server;
    if server.heartbeat_interval_secs == 0 {
        return Err(SettingsError::InvalidValue(
            "server.heartbeatIntervalSecs must be positive".into(),
        ));
    }
    if server.heartbeat_timeout_secs < server.heartbeat_interval_secs {
        return Err(SettingsError::InvalidValue(format!(
            "server.heartbeatTimeoutSecs ({}) is shorter than the interval ({})",
            server.heartbeat_timeout_secs, server.heartbeat_interval_secs
        )));
    }
    if server.send_queue_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "server.sendQueueCapacity must be positive".into(),
        ));
    }
    if settings.pool.reap_interval_secs == 0 || settings.pool.line_buffer == 0 {
        return Err(SettingsError::InvalidValue(
            "pool.reapIntervalSecs and pool.lineBuffer must be positive".into(),
        ));
    }
    if settings.agent.binary.trim().is_empty() {
        return Err(SettingsError::InvalidValue("agent.binary is empty".into()));
    }
    if let Some(budget) = settings.agent.max_budget_usd {
        if !budget.is_finite() || budget <= 0.0 {
            return Err(SettingsError::InvalidValue(format!(
                "agent.maxBudgetUsd must be a positive number, got {budget}"
            )));
        }
    }
    Ok(())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse an auth mode name (`api_key`/`apikey` or `oauth`).
pub fn parse_auth_mode(val: &str) -> Option<AuthMode> {
    match val.to_lowercase().as_str() {
        "api_key" | "apikey" | "key" => Some(AuthMode::ApiKey),
        "oauth" => Some(AuthMode::Oauth),
        _ => None,
    }
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
