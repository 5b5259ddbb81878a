//! HTTP server for the health and metrics endpoints

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::health::{now_epoch_secs, HealthSnapshot, HealthState};
use crate::metrics::encode_metrics;

#[derive(Serialize)]
pub struct HealthResponse {
    pub subject: String,
    #[serde(flatten)]
    pub snapshot: HealthSnapshot,
}

/// Shared state for the health endpoint
#[derive(Clone)]
pub struct ServerState {
    pub subject: String,
    pub health: HealthState,
    /// Pending events older than this report the service unhealthy
    pub flush_overdue_secs: u64,
}

impl ServerState {
    pub fn new(subject: impl Into<String>, health: HealthState, flush_overdue_secs: u64) -> Self {
        Self {
            subject: subject.into(),
            health,
            flush_overdue_secs,
        }
    }
}

/// 200 while batches keep reaching the sink, 503 while one is held back
/// by a failing sink or has waited too long for a flush
async fn healthz(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = state
        .health
        .snapshot(now_epoch_secs(), state.flush_overdue_secs);
    let status_code = if snapshot.is_healthy() {
        StatusCode::OK
    } else {
        warn!(status = ?snapshot.status, pending_secs = ?snapshot.pending_secs, "Health check failing");
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            subject: state.subject.clone(),
            snapshot,
        }),
    )
}

/// Prometheus text format
async fn metrics() -> impl IntoResponse {
    match encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {}", e),
        ),
    }
}

pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until `shutdown` fires.
pub async fn run_server(
    addr: SocketAddr,
    state: ServerState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Ops server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
