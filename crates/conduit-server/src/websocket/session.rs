//! WebSocket session lifecycle: one connected viewer from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use conduit_core::metric_names::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use conduit_runtime::TurnScheduler;

use super::broadcast::BroadcastManager;
use super::connection::ClientConnection;
use super::handler::handle_message;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::config::ServerConfig;

/// Run a viewer session.
///
/// 1. Registers the connection for broadcasts and sends a `connected` frame
///    listing the sessions currently streaming
/// 2. Spawns the outbound writer (queued frames plus periodic pings) and the
///    inactivity monitor
/// 3. Dispatches inbound text frames until close, error, timeout or shutdown
/// 4. Unregisters and detaches from any active stream. Turns keep running.
#[instrument(skip_all, fields(conn_id = %client_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    client_id: String,
    scheduler: Arc<TurnScheduler>,
    broadcast: Arc<BroadcastManager>,
    config: ServerConfig,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(config.send_queue_capacity.max(1));
    let connection = Arc::new(ClientConnection::new(client_id.clone(), send_tx));
    let cancel = shutdown.child_token();

    let started = Instant::now();
    info!("viewer connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    broadcast.add(Arc::clone(&connection));
    let _ = connection.send_json(&serde_json::json!({
        "type": "connected",
        "connection_id": client_id.as_str(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "streaming_sessions": scheduler.streams().streaming_sessions(),
    }));

    let ping_every = config.heartbeat_interval();
    let outbound_cancel = cancel.clone();
    let outbound = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_every);
        // Skip the immediate first tick
        let _ = ping.tick().await;

        loop {
            tokio::select! {
                biased;
                () = outbound_cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        // Writer gone: the read loop must not outlive it.
        outbound_cancel.cancel();
    });

    let heartbeat = tokio::spawn({
        let connection = Arc::clone(&connection);
        let cancel = cancel.clone();
        let timeout = config.heartbeat_timeout();
        async move {
            if run_heartbeat(connection, ping_every, timeout, cancel.clone()).await
                == HeartbeatResult::TimedOut
            {
                cancel.cancel();
            }
        }
    });

    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(error)) => {
                debug!(%error, "websocket read failed");
                break;
            }
            None => break,
        };
        connection.mark_alive();

        let text = match msg {
            Message::Text(text) => text.to_string(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    info!(len = data.len(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                info!("viewer sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        handle_message(&text, &connection, &scheduler).await;
    }

    // Clean up
    cancel.cancel();
    let _ = broadcast.remove(&client_id);
    let detached = scheduler.streams().detach_all(&client_id);
    let (outbound, heartbeat) = (outbound.await, heartbeat.await);
    if outbound.is_err() || heartbeat.is_err() {
        warn!("viewer task panicked");
    }
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    info!(
        detached,
        dropped = connection.drop_count(),
        duration_secs = started.elapsed().as_secs(),
        "viewer disconnected"
    );
}
