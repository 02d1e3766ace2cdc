//! `ConduitServer`: Axum HTTP + WebSocket gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use conduit_runtime::TurnScheduler;
use conduit_worker::WorkerPool;

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse, WorkersResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::broadcast::BroadcastManager;
use crate::websocket::event_bridge::EventBridge;
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Turn scheduler viewers talk to.
    pub scheduler: Arc<TurnScheduler>,
    /// Persistent worker pool, absent when every turn is one-shot.
    pub pool: Option<Arc<WorkerPool>>,
    /// Viewer fan-out.
    pub broadcast: Arc<BroadcastManager>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Listener and viewer settings.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle backing `/metrics`.
    pub metrics: Option<PrometheusHandle>,
}

/// The Conduit gateway.
pub struct ConduitServer {
    state: AppState,
}

impl ConduitServer {
    /// Create a server in front of `scheduler`.
    pub fn new(
        config: ServerConfig,
        scheduler: Arc<TurnScheduler>,
        pool: Option<Arc<WorkerPool>>,
    ) -> Self {
        Self {
            state: AppState {
                scheduler,
                pool,
                broadcast: Arc::new(BroadcastManager::new()),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                config: Arc::new(config),
                start_time: Instant::now(),
                metrics: None,
            },
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/workers", get(workers_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind and serve in the background until shutdown.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.state.shutdown.token();
        info!(%addr, "conduit server listening");

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(error) = serve.await {
                error!(%error, "server error");
            }
        });
        Ok((addr, handle))
    }

    /// Bridge from the scheduler's lifecycle events to every viewer.
    ///
    /// Stops with the server.
    pub fn event_bridge(&self) -> EventBridge {
        EventBridge::new(
            self.state.scheduler.emitter().subscribe(),
            Arc::clone(&self.state.broadcast),
            self.state.shutdown.token(),
        )
    }

    /// Get the broadcast manager.
    pub fn broadcast(&self) -> &Arc<BroadcastManager> {
        &self.state.broadcast
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let connections = state.broadcast.connection_count();
    if connections >= state.config.max_connections {
        warn!(connections, "viewer rejected: connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }

    let client_id = format!("viewer_{}", Uuid::now_v7().simple());
    let shutdown = state.shutdown.child_token();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| {
            run_ws_session(
                socket,
                client_id,
                state.scheduler,
                state.broadcast,
                ServerConfig::clone(&state.config),
                shutdown,
            )
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.broadcast.connection_count(),
        state.scheduler.streams().streaming_sessions().len(),
    ))
}

/// GET /workers
async fn workers_handler(State(state): State<AppState>) -> Json<WorkersResponse> {
    Json(health::workers_report(
        state.pool.as_deref(),
        state.scheduler.streams(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use conduit_worker::{LaunchConfig, PoolConfig};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    use crate::testing::{FakeScript, scheduler};

    fn make_server() -> ConduitServer {
        let (scheduler, _) = scheduler(FakeScript::replying(&[]));
        ConduitServer::new(ServerConfig::default(), scheduler, None)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let (status, body) = get_json(make_server().router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["streaming_sessions"], 0);
        assert!(body["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn workers_endpoint_without_pool() {
        let server = make_server();
        let _stream = server
            .state
            .scheduler
            .streams()
            .try_register(conduit_core::SessionId::new(5))
            .unwrap();
        let (status, body) = get_json(server.router(), "/workers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pool_enabled"], false);
        assert_eq!(body["streaming_sessions"], serde_json::json!([5]));
    }

    #[tokio::test]
    async fn workers_endpoint_with_pool() {
        let (scheduler, _) = scheduler(FakeScript::replying(&[]));
        let pool = Arc::new(WorkerPool::new(LaunchConfig::new("true"), PoolConfig::default()));
        let server = ConduitServer::new(ServerConfig::default(), scheduler, Some(pool));
        let (_, body) = get_json(server.router(), "/workers").await;
        assert_eq!(body["pool_enabled"], true);
        assert_eq!(body["workers"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let app = make_server().with_metrics(handle).router();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn metrics_endpoint_without_recorder() {
        let app = make_server().router();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ws_without_upgrade_is_rejected() {
        let app = make_server().router();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = make_server().router();
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_ephemeral_port_and_stops_on_shutdown() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
