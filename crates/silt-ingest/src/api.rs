//! Ingest HTTP API
//!
//! The control surface remote consumers drive:
//!
//! - `GET /next` claims the oldest flushed segment; 200 with the body and
//!   the claim token in `X-Segment-Token`, 404 when nothing is claimable.
//! - `POST /commit?token=T` deletes the claimed segment; 204, or 404 when
//!   the token timed out.
//! - `POST /fail?token=T` returns it to flushed; 204, or 404 likewise.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header::HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tracing::{error, warn};

use crate::error::Error;
use crate::log::IngestLog;
use crate::metrics::IngestMetrics;

pub const SEGMENT_TOKEN_HEADER: &str = "x-segment-token";

#[derive(Clone)]
pub struct IngestApiState {
    pub log: Arc<IngestLog>,
    pub metrics: Arc<IngestMetrics>,
}

pub fn router(state: IngestApiState) -> Router {
    Router::new()
        .route("/next", get(next))
        .route("/commit", post(commit))
        .route("/fail", post(fail))
        .with_state(state)
}

async fn next(State(state): State<IngestApiState>) -> Response {
    let claimed = match state.log.oldest().await {
        Ok(Some(claimed)) => claimed,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!(error = %err, "claim failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    match state.log.read_claimed(&claimed).await {
        Ok(body) => (
            StatusCode::OK,
            [(HeaderName::from_static(SEGMENT_TOKEN_HEADER), claimed.token)],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, token = %claimed.token, "claimed segment unreadable");
            // Give the segment back rather than stranding it until the sweep.
            if let Err(err) = state.log.fail(&claimed.token).await {
                warn!(error = %err, "failing unreadable claim");
            }
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: String,
}

async fn commit(
    State(state): State<IngestApiState>,
    Query(query): Query<TokenQuery>,
) -> StatusCode {
    match state.log.commit(&query.token).await {
        Ok(bytes) => {
            state.metrics.committed_segments.inc();
            state.metrics.committed_bytes.inc_by(bytes);
            StatusCode::NO_CONTENT
        }
        Err(Error::NoSuchToken(_)) => StatusCode::NOT_FOUND,
        Err(err) => {
            error!(error = %err, token = %query.token, "commit failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn fail(State(state): State<IngestApiState>, Query(query): Query<TokenQuery>) -> StatusCode {
    match state.log.fail(&query.token).await {
        Ok(()) => {
            state.metrics.failed_segments.inc();
            StatusCode::NO_CONTENT
        }
        Err(Error::NoSuchToken(_)) => StatusCode::NOT_FOUND,
        Err(err) => {
            error!(error = %err, token = %query.token, "fail failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
