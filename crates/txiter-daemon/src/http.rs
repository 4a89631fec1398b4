//! Iterator HTTP status and control surface.
//!
//! | Route | Answer |
//! |-------|--------|
//! | `GET /status` | full [`IteratorStatus`] as JSON |
//! | `GET /seqnum` | next seq# to resolve, plain text |
//! | `GET /leader` | `true` or `false` |
//! | `POST /terminate` | moves the iterator to `Terminating` |
//! | `POST /conflicts/:seq/ack` | accepts the stored digest at `seq` |
//! | `GET /metrics` | Prometheus text format |

use std::future::Future;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{error, info};
use txiter_core::resolution::EngineError;
use txiter_core::runtime::RuntimeError;
use txiter_core::{IteratorStatus, RuntimeHandle, SeqNum};

use crate::metrics::SharedMetricsRegistry;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    handle: RuntimeHandle,
    metrics: Option<SharedMetricsRegistry>,
}

impl AppState {
    /// Creates handler state for one iterator.
    #[must_use]
    pub const fn new(handle: RuntimeHandle, metrics: Option<SharedMetricsRegistry>) -> Self {
        Self { handle, metrics }
    }
}

/// Builds the iterator router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/seqnum", get(seqnum))
        .route("/leader", get(leader))
        .route("/terminate", post(terminate))
        .route("/conflicts/:seq/ack", post(acknowledge_conflict))
        .route("/metrics", get(iterator_metrics))
        .with_state(state)
}

/// Builds a router that only serves `/metrics`.
pub fn metrics_router(registry: SharedMetricsRegistry) -> Router {
    Router::new()
        .route("/metrics", get(supervisor_metrics))
        .with_state(registry)
}

/// Serves `router` on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP server listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn status(State(state): State<AppState>) -> Json<IteratorStatus> {
    Json(state.handle.status())
}

async fn seqnum(State(state): State<AppState>) -> String {
    state.handle.status().next_seq.to_string()
}

async fn leader(State(state): State<AppState>) -> &'static str {
    if state.handle.status().role.is_leader() {
        "true"
    } else {
        "false"
    }
}

async fn terminate(State(state): State<AppState>) -> (StatusCode, &'static str) {
    info!("Terminate requested over HTTP");
    state.handle.terminate().await;
    (StatusCode::ACCEPTED, "terminating")
}

async fn acknowledge_conflict(
    State(state): State<AppState>,
    Path(seq): Path<SeqNum>,
) -> Response {
    match state.handle.acknowledge_conflict(seq).await {
        Ok(report) => Json(report).into_response(),
        Err(RuntimeError::Engine(EngineError::UnknownConflict { seq })) => (
            StatusCode::NOT_FOUND,
            format!("no conflict outstanding at seq# {seq}"),
        )
            .into_response(),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
    }
}

fn encode(registry: &SharedMetricsRegistry) -> Response {
    match registry.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {e}"),
            )
                .into_response()
        },
    }
}

async fn iterator_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(registry) => encode(registry),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

async fn supervisor_metrics(State(registry): State<SharedMetricsRegistry>) -> Response {
    encode(&registry)
}
