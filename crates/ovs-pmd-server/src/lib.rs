//! HTTP exporter for Open vSwitch PMD telemetry.
//!
//! Serves the published snapshot in the Prometheus text format on
//! `/metrics` and as JSON on `/snapshot`. A scrape triggers at most one
//! rebuild per poll interval; the rebuild runs on the blocking pool so the
//! async runtime keeps answering other requests.

pub mod exposition;

use std::sync::Arc;
use std::time::SystemTime;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use log::{debug, error};
use serde::Serialize;

use ovs_pmd_core::{RefreshOutcome, SnapshotCache};

pub use exposition::{MetricTable, PmdMetric, standard_pmd_metrics};

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared server state.
struct AppState {
    cache: Arc<SnapshotCache>,
    table: MetricTable,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    system_id: String,
    pmd_threads: usize,
    request_errors: u64,
    requests_total: u64,
    collected_unix_ms: u64,
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    let cache = state.cache.clone();
    match tokio::task::spawn_blocking(move || cache.refresh(SystemTime::now())).await {
        Ok(RefreshOutcome::Rebuilt { failures }) => {
            debug!("snapshot rebuilt on scrape ({failures} sub-collections failed)")
        }
        Ok(outcome) => debug!("serving cached snapshot ({outcome:?})"),
        Err(e) => error!("snapshot rebuild task failed: {e}"),
    }

    let snap = state.cache.snapshot();
    match state.table.render(&snap) {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!("failed to encode metrics: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn handle_snapshot(State(state): State<Arc<AppState>>) -> Response {
    Json(&*state.cache.snapshot()).into_response()
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let snap = state.cache.snapshot();
    Json(HealthResponse {
        status: if snap.up { "up" } else { "down" },
        system_id: snap.system_id().to_string(),
        pmd_threads: snap.pmd_threads.len(),
        request_errors: snap.request_errors,
        requests_total: snap.requests_total,
        collected_unix_ms: snap.collected_unix_ms,
    })
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "ovs-pmd-exporter",
        "version": ovs_pmd_core::VERSION,
        "namespace": state.table.namespace(),
        "poll_interval_secs": state.cache.poll_interval().as_secs(),
        "endpoints": {
            "/": "This API index",
            "/metrics": "Prometheus text exposition (rebuilds at most once per poll interval)",
            "/snapshot": "Last published snapshot as JSON",
            "/health": "Overall up/down status",
        }
    }))
}

/// Build the axum router.
pub fn build_router(cache: Arc<SnapshotCache>, table: MetricTable) -> Router {
    let state = Arc::new(AppState { cache, table });

    Router::new()
        .route("/", get(handle_index))
        .route("/metrics", get(handle_metrics))
        .route("/snapshot", get(handle_snapshot))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Run the HTTP server until the listener fails.
pub async fn run_server(
    cache: Arc<SnapshotCache>,
    table: MetricTable,
    host: &str,
    port: u16,
) -> std::io::Result<()> {
    let app = build_router(cache, table);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("listening on http://{addr}");
    axum::serve(listener, app).await
}
