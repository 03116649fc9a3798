//! HTTP + WebSocket surface over the dispatcher and the conversation manager.

pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    routing::{get, post, put},
};
use serde_json::json;

use crate::automation::{ConversationManager, InboundHandler};
use crate::dispatch::Dispatcher;
use crate::error::{Error, JobError};
use crate::events::EventBus;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub conversations: Arc<ConversationManager>,
    pub inbound: Arc<InboundHandler>,
    pub events: EventBus,
}

/// Build the Axum router with REST routes and the event stream.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/ws/events", get(ws::ws_handler))
        .route("/api/jobs", post(routes::create_job))
        .route(
            "/api/jobs/{id}",
            get(routes::get_job).delete(routes::delete_job),
        )
        .route("/api/jobs/{id}/items", get(routes::list_job_items))
        .route("/api/jobs/{id}/cancel", post(routes::cancel_job))
        .route("/api/devices/{device}/jobs", get(routes::list_jobs))
        .route("/api/inbound", post(routes::inbound))
        .route(
            "/api/conversations/{device}/{counterpart}/handoff",
            post(routes::request_handoff),
        )
        .route(
            "/api/conversations/{device}/{counterpart}/resume",
            post(routes::resume_bot),
        )
        .route(
            "/api/devices/{device}/conversations",
            get(routes::list_conversations),
        )
        .route(
            "/api/devices/{device}/rules",
            get(routes::list_rules).post(routes::create_rule),
        )
        .route(
            "/api/rules/{id}",
            put(routes::update_rule).delete(routes::delete_rule),
        )
        .with_state(state)
}

/// Map a crate error onto an HTTP status and JSON body.
pub(crate) fn error_response(err: &Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Job(JobError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Job(JobError::StillActive { .. } | JobError::DispatcherRunning) => {
            StatusCode::CONFLICT
        }
        Error::Delivery(_) => StatusCode::BAD_GATEWAY,
        Error::Database(_) | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        tracing::error!(error = %err, "Request failed");
    }
    (status, Json(json!({"error": err.to_string()})))
}
