//! Read API
//!
//! Serves the most recent samples straight from the latest-batch cache,
//! the liveness check, and Prometheus self-metrics. Time-series sink
//! queries go to the configured backends, not here; this API exists so
//! clients can read the freshest batch without one.

use aggregator_lib::model::{metric_names, node_key, pod_container_key, pod_key, MetricValue};
use aggregator_lib::sink::MetricSink;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// The health check trips when the newest batch is older than this.
const MAX_BATCH_AGE_MINUTES: i64 = 3;

/// Shared application state
pub struct AppState {
    pub metric_sink: Arc<MetricSink>,
}

#[derive(Debug, Deserialize)]
pub struct TimeRange {
    start: Option<String>,
    end: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: MetricValue,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricResult {
    pub metrics: Vec<MetricPoint>,
    pub latest_timestamp: Option<DateTime<Utc>>,
}

fn parse_rfc3339(
    value: Option<&str>,
    param: &str,
) -> Result<Option<DateTime<Utc>>, (StatusCode, String)> {
    match value {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| {
                (
                    StatusCode::BAD_REQUEST,
                    format!("invalid {param} timestamp {s:?}: {e}"),
                )
            }),
    }
}

fn series(
    state: &AppState,
    key: &str,
    metric: &str,
    range: &TimeRange,
) -> Result<Json<MetricResult>, (StatusCode, String)> {
    let start = parse_rfc3339(range.start.as_deref(), "start")?;
    let end = parse_rfc3339(range.end.as_deref(), "end")?;

    let metrics: Vec<MetricPoint> = state
        .metric_sink
        .metric_samples(key, metric, start, end)
        .into_iter()
        .map(|p| MetricPoint {
            timestamp: p.timestamp,
            value: p.value,
        })
        .collect();
    let latest_timestamp = metrics.last().map(|p| p.timestamp);

    Ok(Json(MetricResult {
        metrics,
        latest_timestamp,
    }))
}

/// Known metric names.
async fn list_metrics() -> Json<Vec<String>> {
    Json(metric_names())
}

async fn node_metrics(
    State(state): State<Arc<AppState>>,
    Path((node, metric)): Path<(String, String)>,
    Query(range): Query<TimeRange>,
) -> Result<Json<MetricResult>, (StatusCode, String)> {
    series(&state, &node_key(&node), &metric, &range)
}

async fn pod_metrics(
    State(state): State<Arc<AppState>>,
    Path((namespace, pod, metric)): Path<(String, String, String)>,
    Query(range): Query<TimeRange>,
) -> Result<Json<MetricResult>, (StatusCode, String)> {
    series(&state, &pod_key(&namespace, &pod), &metric, &range)
}

async fn container_metrics(
    State(state): State<Arc<AppState>>,
    Path((namespace, pod, container, metric)): Path<(String, String, String, String)>,
    Query(range): Query<TimeRange>,
) -> Result<Json<MetricResult>, (StatusCode, String)> {
    series(
        &state,
        &pod_container_key(&namespace, &pod, &container),
        &metric,
        &range,
    )
}

/// Liveness: 200 while the latest batch is fresh and non-empty, 500
/// otherwise. This is the only user-visible degradation signal.
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metric_sink.latest_batch_info() {
        Some((timestamp, size))
            if size >= 1
                && Utc::now() - timestamp < ChronoDuration::minutes(MAX_BATCH_AGE_MINUTES) =>
        {
            (StatusCode::OK, "ok".to_string())
        }
        Some((timestamp, _)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(
                "No current data batch available (latest: {})",
                timestamp.to_rfc3339()
            ),
        ),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "No current data batch available (latest: none)".to_string(),
        ),
    }
}

/// Prometheus self-metrics.
async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/model/metrics", get(list_metrics))
        .route("/api/v1/model/nodes/:node/metrics/:metric", get(node_metrics))
        .route(
            "/api/v1/model/namespaces/:namespace/pods/:pod/metrics/:metric",
            get(pod_metrics),
        )
        .route(
            "/api/v1/model/namespaces/:namespace/pods/:pod/containers/:container/metrics/:metric",
            get(container_metrics),
        )
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve the read API, with TLS when a certificate pair is configured.
pub async fn serve(
    addr: SocketAddr,
    tls: Option<(PathBuf, PathBuf)>,
    state: Arc<AppState>,
) -> Result<()> {
    let app = create_router(state);

    match tls {
        Some((cert, key)) => {
            info!(addr = %addr, "Starting read API with TLS");
            let config = RustlsConfig::from_pem_file(&cert, &key)
                .await
                .with_context(|| format!("failed to load TLS material from {cert:?}/{key:?}"))?;
            axum_server::bind_rustls(addr, config)
                .serve(app.into_make_service())
                .await
                .context("TLS API server failed")
        }
        None => {
            info!(addr = %addr, "Starting read API");
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            axum::serve(listener, app)
                .await
                .context("API server failed")
        }
    }
}
