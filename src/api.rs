//! HTTP adapter over the automation core, plus the inbound reply webhooks.

use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::IntakeError;
use crate::intake::{IntakeCoordinator, LeadPayload};
use crate::messaging::{InboundEmail, InboundReplyHandler, InboundSms, MessageDispatcher};
use crate::sequences::{SequenceRunner, StopReason};
use crate::store::Database;

const EMPTY_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;
const DEFAULT_FAILED_LIMIT: usize = 100;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Database>,
    pub intake: Arc<IntakeCoordinator>,
    pub runner: Arc<SequenceRunner>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub inbound: Arc<InboundReplyHandler>,
}

/// Build the Axum router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tenants/{tenant_id}/leads", post(create_lead))
        .route("/api/tenants/{tenant_id}/messages/failed", get(list_failed))
        .route("/api/leads/{lead_id}/sequence/stop", post(stop_sequence))
        .route("/api/messages/{message_id}/requeue", post(requeue_message))
        .route("/webhooks/sms", post(inbound_sms))
        .route("/webhooks/email", post(inbound_email))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn parse_id(raw: &str, what: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("Invalid {what} ID")})),
        )
            .into_response()
    })
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    error!("Request failed: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal error"})),
    )
        .into_response()
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "leadflow"
    }))
}

// ── Leads ───────────────────────────────────────────────────────────────

async fn create_lead(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<LeadPayload>,
) -> Response {
    let tenant_id = match parse_id(&tenant_id, "tenant") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.intake.intake(tenant_id, payload).await {
        Ok(result) => {
            let status = if result.deduped {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, Json(json!(result))).into_response()
        }
        Err(IntakeError::UnknownTenant(id)) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Unknown tenant {id}")})),
        )
            .into_response(),
        Err(IntakeError::InvalidPayload(reason)) => {
            warn!(tenant_id = %tenant_id, "Rejected lead payload: {reason}");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"error": reason})),
            )
                .into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct StopRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn stop_sequence(
    State(state): State<AppState>,
    Path(lead_id): Path<String>,
    Json(body): Json<StopRequest>,
) -> Response {
    let lead_id = match parse_id(&lead_id, "lead") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.store.get_lead(lead_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Lead not found"})),
            )
                .into_response();
        }
        Err(e) => return internal_error(e),
    }

    let reason = body
        .reason
        .as_deref()
        .map(StopReason::from_db)
        .unwrap_or(StopReason::Manual);

    match state.runner.stop(lead_id, reason).await {
        Ok(stopped) => (
            StatusCode::OK,
            Json(json!({"status": "stopped", "reason": reason, "enrollments_stopped": stopped})),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

// ── Messages ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FailedQuery {
    limit: Option<usize>,
}

async fn list_failed(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(query): Query<FailedQuery>,
) -> Response {
    let tenant_id = match parse_id(&tenant_id, "tenant") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let limit = query.limit.unwrap_or(DEFAULT_FAILED_LIMIT).min(500);
    match state.dispatcher.list_failed(tenant_id, limit).await {
        Ok(messages) => Json(json!(messages)).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn requeue_message(State(state): State<AppState>, Path(message_id): Path<String>) -> Response {
    let message_id = match parse_id(&message_id, "message") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.dispatcher.requeue(message_id).await {
        Ok(true) => Json(json!({"status": "requeued"})).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Message not found or not failed"})),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

// ── Webhooks ────────────────────────────────────────────────────────────

async fn inbound_sms(State(state): State<AppState>, Form(sms): Form<InboundSms>) -> Response {
    match state.inbound.handle_inbound_sms(&sms).await {
        Ok(_) => ([(header::CONTENT_TYPE, "text/xml")], EMPTY_TWIML).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn inbound_email(State(state): State<AppState>, Json(email): Json<InboundEmail>) -> Response {
    match state.inbound.handle_inbound_email(&email).await {
        Ok(outcome) => Json(json!(outcome)).into_response(),
        Err(e) => internal_error(e),
    }
}
