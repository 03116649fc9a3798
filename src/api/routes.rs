//! REST handlers.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use super::{AppState, error_response};
use crate::automation::{InboundEvent, RuleDraft};

const DEFAULT_JOB_LIST_LIMIT: usize = 50;

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": message}))).into_response()
}

fn parse_job_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| bad_request("Invalid job ID"))
}

// ── Health ──────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "courier"
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateJobRequest {
    device_id: String,
    recipients: Vec<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<CreateJobRequest>,
) -> Response {
    match state
        .dispatcher
        .enqueue_job(&body.device_id, &body.recipients, body.payload)
        .await
    {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(json!({"job_id": job_id, "status": "queued"})),
        )
            .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.dispatcher.get_job(job_id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn delete_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.dispatcher.delete_job(job_id).await {
        Ok(job) => Json(json!({"deleted": job})).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn list_job_items(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.dispatcher.list_job_items(job_id).await {
        Ok(items) => Json(items).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let cancelled = match state.dispatcher.cancel_job(job_id).await {
        Ok(cancelled) => cancelled,
        Err(e) => return error_response(&e).into_response(),
    };
    match state.dispatcher.get_job(job_id).await {
        Ok(job) => Json(json!({"cancelled": cancelled, "job": job})).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    limit: Option<usize>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Path(device): Path<String>,
    Query(query): Query<ListJobsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_JOB_LIST_LIMIT);
    match state.dispatcher.list_jobs(&device, limit).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

// ── Inbound ─────────────────────────────────────────────────────────────

pub async fn inbound(State(state): State<AppState>, Json(event): Json<InboundEvent>) -> Response {
    debug!(device_id = %event.device_id, sender = %event.sender_id, "Inbound message received");
    match state.inbound.handle(&event).await {
        Ok(action) => Json(action).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

// ── Conversations ───────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct HandoffRequest {
    #[serde(default)]
    reason: Option<String>,
}

pub async fn request_handoff(
    State(state): State<AppState>,
    Path((device, counterpart)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let request: HandoffRequest = if body.is_empty() {
        HandoffRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(_) => return bad_request("Invalid handoff request body"),
        }
    };

    let transitioned = match state
        .conversations
        .request_handoff(&device, &counterpart, request.reason.as_deref())
        .await
    {
        Ok(transitioned) => transitioned,
        Err(e) => return error_response(&e).into_response(),
    };
    conversation_response(&state, &device, &counterpart, transitioned).await
}

pub async fn resume_bot(
    State(state): State<AppState>,
    Path((device, counterpart)): Path<(String, String)>,
) -> Response {
    let transitioned = match state.conversations.resume_bot(&device, &counterpart).await {
        Ok(transitioned) => transitioned,
        Err(e) => return error_response(&e).into_response(),
    };
    conversation_response(&state, &device, &counterpart, transitioned).await
}

async fn conversation_response(
    state: &AppState,
    device: &str,
    counterpart: &str,
    transitioned: bool,
) -> Response {
    match state.conversations.get_conversation(device, counterpart).await {
        Ok(conversation) => Json(json!({
            "transitioned": transitioned,
            "conversation": conversation,
        }))
        .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Path(device): Path<String>,
) -> Response {
    match state.conversations.list_conversations(&device).await {
        Ok(conversations) => Json(conversations).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

// ── Rules ───────────────────────────────────────────────────────────────

pub async fn list_rules(State(state): State<AppState>, Path(device): Path<String>) -> Response {
    match state.conversations.list_rules(&device).await {
        Ok(rules) => Json(rules).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn create_rule(
    State(state): State<AppState>,
    Path(device): Path<String>,
    Json(draft): Json<RuleDraft>,
) -> Response {
    match state.conversations.create_rule(&device, &draft).await {
        Ok(rule) => (StatusCode::CREATED, Json(rule)).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(draft): Json<RuleDraft>,
) -> Response {
    match state.conversations.update_rule(id, &draft).await {
        Ok(Some(rule)) => Json(rule).into_response(),
        Ok(None) => not_found("Rule not found"),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn delete_rule(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.conversations.delete_rule(id).await {
        Ok(Some(rule)) => {
            info!(rule_id = id, "Rule deleted via API");
            Json(json!({"deleted": rule})).into_response()
        }
        Ok(None) => not_found("Rule not found"),
        Err(e) => error_response(&e).into_response(),
    }
}
