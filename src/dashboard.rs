//! HTTP/WebSocket surface consumed by the dashboard.
//!
//! Read endpoints serve orchestrator snapshots. `/api/ws` pushes state events
//! and `/api/logs/ws` pushes log lines; the two never share a socket.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::orchestrator::{LogEntry, Orchestrator, ServiceInfo, StatePublisher};

pub const DEFAULT_DASHBOARD_PORT: u16 = 4280;
pub const DEFAULT_DASHBOARD_HOST: &str = "127.0.0.1";
const DEFAULT_LOG_LINES: usize = 100;

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub host: String,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_DASHBOARD_HOST.to_string(),
            port: DEFAULT_DASHBOARD_PORT,
        }
    }
}

struct DashboardState {
    orchestrator: Arc<Orchestrator>,
    publisher: StatePublisher,
}

/// A bound dashboard listener. Binding is the fatal step; serving is not.
pub struct Dashboard {
    listener: TcpListener,
    state: Arc<DashboardState>,
}

impl Dashboard {
    pub async fn bind(config: &DashboardConfig, orchestrator: Arc<Orchestrator>) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|e| {
                OrchestratorError::Bootstrap(format!(
                    "cannot bind dashboard on {}:{}: {}",
                    config.host, config.port, e
                ))
            })?;

        let publisher = StatePublisher::new(Arc::clone(&orchestrator));
        Ok(Self {
            listener,
            state: Arc::new(DashboardState {
                orchestrator,
                publisher,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!("Dashboard API listening on http://{}", addr);

        let app = router(self.state);
        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        debug!("Dashboard API stopped");
        Ok(())
    }
}

fn router(state: Arc<DashboardState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/services", get(services_handler))
        .route("/api/health", get(health_report_handler))
        .route("/api/logs", get(logs_handler))
        .route("/api/ws", get(state_ws_handler))
        .route("/api/logs/ws", get(logs_ws_handler))
        .route("/api/services/{name}/stop", post(stop_handler))
        .route("/api/services/{name}/restart", post(restart_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::UnknownService(_) => StatusCode::NOT_FOUND,
            OrchestratorError::NotRestartable { .. } => StatusCode::CONFLICT,
            OrchestratorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn services_handler(State(state): State<Arc<DashboardState>>) -> Json<Vec<ServiceInfo>> {
    Json(state.orchestrator.snapshot())
}

async fn health_report_handler(State(state): State<Arc<DashboardState>>) -> Json<Value> {
    let services = state.orchestrator.snapshot();
    let report = crate::orchestrator::HealthReport::from_services(&services);
    let checks: Vec<_> = services.into_iter().map(|s| s.health_check).collect();
    Json(json!({
        "overall": report.overall(),
        "summary": report,
        "services": checks,
    }))
}

#[derive(Deserialize)]
struct LogsQuery {
    service: String,
    lines: Option<usize>,
}

async fn logs_handler(
    State(state): State<Arc<DashboardState>>,
    Query(query): Query<LogsQuery>,
) -> std::result::Result<Json<Vec<LogEntry>>, ApiError> {
    state.orchestrator.service(&query.service)?;
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    Ok(Json(state.orchestrator.logs().tail(&query.service, lines)))
}

async fn stop_handler(
    State(state): State<Arc<DashboardState>>,
    Path(name): Path<String>,
) -> std::result::Result<Json<ServiceInfo>, ApiError> {
    Ok(Json(state.orchestrator.stop_service(&name).await?))
}

async fn restart_handler(
    State(state): State<Arc<DashboardState>>,
    Path(name): Path<String>,
) -> std::result::Result<Json<ServiceInfo>, ApiError> {
    Ok(Json(state.orchestrator.restart_service(&name)?))
}

async fn state_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<DashboardState>>,
) -> Response {
    ws.on_upgrade(move |socket| push_state(socket, state))
}

async fn push_state(mut socket: WebSocket, state: Arc<DashboardState>) {
    let mut sub = state.publisher.subscribe();
    loop {
        tokio::select! {
            event = sub.next() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("State subscriber disconnected");
}

#[derive(Deserialize)]
struct LiveLogsQuery {
    service: Option<String>,
}

async fn logs_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<DashboardState>>,
    Query(query): Query<LiveLogsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| push_logs(socket, state, query.service))
}

async fn push_logs(mut socket: WebSocket, state: Arc<DashboardState>, service: Option<String>) {
    let mut rx = state.orchestrator.logs().subscribe();
    loop {
        tokio::select! {
            entry = rx.recv() => match entry {
                Ok(entry) => {
                    if service.as_deref().is_some_and(|s| s != entry.service) {
                        continue;
                    }
                    let Ok(text) = serde_json::to_string(&json!({ "type": "log", "entry": entry })) else {
                        continue;
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Log subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Log subscriber disconnected");
}
