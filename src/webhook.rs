//! Webhook ingress: authenticate a provider callback and hand it to the completion listener.
//!
//! Nothing here reads or writes jobs. A request either fails authentication, or becomes a
//! queued `resolve` item.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::WebhookError;
use crate::pipeline::{Orchestrator, callback_token};
use crate::queue::EnqueueOutcome;
use crate::state_machine::Stage;

pub const TOKEN_HEADER: &str = "x-webhook-token";

struct WebhookState {
    orchestrator: Orchestrator,
    secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

pub fn router(orchestrator: Orchestrator, secret: impl Into<String>) -> Router {
    let state = Arc::new(WebhookState {
        orchestrator,
        secret: secret.into(),
    });
    Router::new()
        .route("/webhooks/{job_id}/{stage}", post(receive))
        .route("/healthz", get(|| async { StatusCode::OK }))
        .with_state(state)
}

async fn receive(
    State(state): State<Arc<WebhookState>>,
    Path((job_id, stage)): Path<(String, String)>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match ingest(&state, &job_id, &stage, query.token, &headers, &body).await {
        Ok(EnqueueOutcome::Enqueued) => {
            (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))).into_response()
        }
        Ok(EnqueueOutcome::Duplicate) => {
            (StatusCode::ACCEPTED, Json(json!({ "status": "ignored" }))).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn ingest(
    state: &WebhookState,
    job_id: &str,
    stage: &str,
    query_token: Option<String>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<EnqueueOutcome, WebhookError> {
    let stage: Stage = stage.parse()?;

    let presented = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query_token);
    let expected = callback_token(&state.secret, job_id, stage);
    if !presented.is_some_and(|token| tokens_match(&token, &expected)) {
        warn!(job_id, %stage, "webhook rejected: invalid token");
        return Err(WebhookError::InvalidToken);
    }

    let payload: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| WebhookError::Payload(e.to_string()))?;
    let outcome = state
        .orchestrator
        .ingest_callback(job_id, stage, &payload)
        .await?;
    info!(job_id, %stage, ?outcome, "webhook accepted");
    Ok(outcome)
}

/// Compare digests so the comparison time does not depend on where the tokens differ.
fn tokens_match(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            WebhookError::InvalidToken => (StatusCode::UNAUTHORIZED, "invalid_token"),
            WebhookError::UnknownStage(_) => (StatusCode::NOT_FOUND, "unknown_stage"),
            WebhookError::NotCallbackStage(_) => (StatusCode::NOT_FOUND, "not_callback_stage"),
            WebhookError::Payload(_) => (StatusCode::BAD_REQUEST, "invalid_payload"),
            WebhookError::Queue(_) => (StatusCode::SERVICE_UNAVAILABLE, "queue_error"),
        };
        (
            status,
            Json(json!({
                "error": code,
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}
