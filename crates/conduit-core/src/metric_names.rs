//! Metric name constants shared across crates.

/// Agent worker processes spawned (counter).
pub const WORKERS_SPAWNED_TOTAL: &str = "conduit_workers_spawned_total";
/// Agent worker processes reaped (counter).
pub const WORKERS_REAPED_TOTAL: &str = "conduit_workers_reaped_total";
/// Recovery attempts after a failed turn (counter, labels: stage).
pub const TURN_RECOVERIES_TOTAL: &str = "conduit_turn_recoveries_total";
/// One-shot fallbacks (counter).
pub const ONE_SHOT_FALLBACKS_TOTAL: &str = "conduit_one_shot_fallbacks_total";
/// Turns started (counter).
pub const TURNS_TOTAL: &str = "conduit_turns_total";
/// Turns that ended with an error (counter, labels: category).
pub const TURN_ERRORS_TOTAL: &str = "conduit_turn_errors_total";
/// Turn duration in seconds (histogram).
pub const TURN_DURATION_SECONDS: &str = "conduit_turn_duration_seconds";
/// Turns in flight (gauge).
pub const TURNS_ACTIVE: &str = "conduit_turns_active";
/// Messages queued behind a busy session (counter).
pub const MESSAGES_QUEUED_TOTAL: &str = "conduit_messages_queued_total";
/// WebSocket connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "conduit_ws_connections_total";
/// WebSocket disconnections (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "conduit_ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "conduit_ws_connections_active";
/// Outbound messages dropped because a viewer queue was full (counter).
pub const WS_SEND_DROPS_TOTAL: &str = "conduit_ws_send_drops_total";
