//! HTTP surface: the receiving edge posts inbound notifications here.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tracing::{info, warn};

use crate::forwarder::{Forwarder, ForwardReport, MessageState};
use crate::message::InboundMessage;
use crate::rules::RuleSetService;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub forwarder: Arc<Forwarder>,
    pub rules: Arc<dyn RuleSetService>,
}

/// Build the Axum router with the inbound and health routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/inbound", post(inbound))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.rules.active_rule_set().await {
        Ok(active) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "service": "ses-proxy",
                "active_rule_set": active,
            })),
        ),
        Err(e) => {
            warn!(error = %e, "Health check could not read the active rule set");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "degraded",
                    "service": "ses-proxy",
                    "error": e.to_string(),
                })),
            )
        }
    }
}

// ── Inbound ─────────────────────────────────────────────────────────────

async fn inbound(
    State(state): State<AppState>,
    Json(message): Json<InboundMessage>,
) -> impl IntoResponse {
    info!(
        message_id = %message.message_id,
        recipients = message.recipients.len(),
        "Inbound notification"
    );
    let report = state.forwarder.forward(&message).await;
    (status_for(&report), Json(report))
}

/// `200` when dispatched, `422` when the message itself cannot be
/// forwarded, `502` when the edge should retry.
pub fn status_for(report: &ForwardReport) -> StatusCode {
    match report.state {
        MessageState::Dispatched => StatusCode::OK,
        MessageState::Rejected | MessageState::Unroutable => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::BAD_GATEWAY,
    }
}
