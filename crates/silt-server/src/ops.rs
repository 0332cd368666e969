//! Operational endpoints and HTTP instrumentation.
//!
//! `/metrics` exposes the injected registry in the Prometheus text format,
//! `/-/healthy` answers liveness probes, and `/cluster/info` advertises the
//! node identity the membership layer probes for. The `track_requests`
//! middleware times every API request by method, path, and status.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, HistogramOpts, HistogramVec, Registry, TextEncoder};
use silt_cluster::NodeInfo;
use tracing::error;

pub struct HttpMetrics {
    pub request_duration: HistogramVec,
}

impl HttpMetrics {
    pub fn new(registry: &Registry) -> Self {
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "silt_api_request_duration_seconds",
                "API request duration in seconds.",
            ),
            &["method", "path", "status_code"],
        )
        .expect("metric can be created");
        registry
            .register(Box::new(request_duration.clone()))
            .expect("metric can be registered");
        Self { request_duration }
    }
}

/// Axum middleware timing each request.
pub async fn track_requests(
    State(metrics): State<Arc<HttpMetrics>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(req).await;
    metrics
        .request_duration
        .with_label_values(&[method.as_str(), &path, response.status().as_str()])
        .observe(start.elapsed().as_secs_f64());
    response
}

#[derive(Clone)]
pub struct OpsState {
    pub registry: Registry,
    pub identity: NodeInfo,
}

pub fn router(state: OpsState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/-/healthy", get(healthy))
        .route("/cluster/info", get(cluster_info))
        .with_state(state)
}

async fn metrics(State(state): State<OpsState>) -> Response {
    let families = state.registry.gather();
    let mut buf = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&families, &mut buf) {
        error!(error = %err, "metrics encoding failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}

async fn healthy() -> StatusCode {
    StatusCode::OK
}

async fn cluster_info(State(state): State<OpsState>) -> Json<NodeInfo> {
    Json(state.identity)
}
