//! Store HTTP API
//!
//! - `POST /replicate` accepts a whole segment body from a peer; 204 on
//!   success, idempotent by range name, 400 for malformed records.
//! - `GET /query?from=ULID&to=ULID` streams the records in the range.
//! - `GET /stats` reports segment statistics for health checks.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tracing::{error, warn};
use ulid::Ulid;

use crate::log::StoreLog;
use crate::metrics::StoreMetrics;

#[derive(Clone)]
pub struct StoreApiState {
    pub log: Arc<StoreLog>,
    pub metrics: Arc<StoreMetrics>,
}

pub fn router(state: StoreApiState) -> Router {
    Router::new()
        .route("/replicate", post(replicate))
        .route("/query", get(query))
        .route("/stats", get(stats))
        .with_state(state)
}

async fn replicate(State(state): State<StoreApiState>, body: Bytes) -> Response {
    match state.log.append(&body).await {
        Ok(_) => {
            state
                .metrics
                .replicated_segments
                .with_label_values(&["ingress"])
                .inc();
            state
                .metrics
                .replicated_bytes
                .with_label_values(&["ingress"])
                .inc_by(body.len() as u64);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) if err.is_malformed() => {
            warn!(error = %err, "rejected malformed replication body");
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        Err(err) => {
            error!(error = %err, "replication ingress failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    from: String,
    to: String,
}

async fn query(State(state): State<StoreApiState>, Query(range): Query<RangeQuery>) -> Response {
    let (Ok(from), Ok(to)) = (
        Ulid::from_string(&range.from),
        Ulid::from_string(&range.to),
    ) else {
        return (StatusCode::BAD_REQUEST, "from and to must be ULIDs").into_response();
    };
    match state.log.query(from, to).await {
        Ok(records) => {
            let mut body = Vec::new();
            for record in &records {
                body.extend_from_slice(record);
                body.push(b'\n');
            }
            (StatusCode::OK, body).into_response()
        }
        Err(err) => {
            error!(error = %err, "query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn stats(State(state): State<StoreApiState>) -> Response {
    match state.log.statistics().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => {
            error!(error = %err, "statistics failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
