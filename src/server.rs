//! HTTP serving layer for the triage assistant.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/events` | Score, correlate, and answer a raw event |
//! | `POST` | `/chat` | Handle one operator message |
//! | `GET`  | `/status` | Store/index counts and backend info |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses follow one schema:
//!
//! ```json
//! { "error": { "code": "generation", "message": "generation failed: ..." } }
//! ```
//!
//! The `code` is the pipeline error category (`encoding`, `index_empty`,
//! `not_found`, `scoring`, `assembly`, `generation`, `unavailable`,
//! `config`, `store`) or `bad_request` / `unauthorized` for request-level
//! failures. A failed generation is always an explicit error with its
//! category — never a fabricated or empty answer.
//!
//! # Inbound verification
//!
//! When `[notify].signing_secret` is set, `POST /chat` requires
//! `x-triage-timestamp` and `x-triage-signature` headers; the signature is
//! HMAC-SHA256 over `v0:{timestamp}:{body}` (see [`crate::notify`]).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser
//! clients and chat-platform callbacks.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::error::AssistError;
use crate::models::{OperatorMessage, RawEvent};
use crate::notify::verify_signature;
use crate::pipeline::Assistant;

#[derive(Clone)]
struct AppState {
    assistant: Arc<Assistant>,
}

/// Starts the HTTP server on `[server].bind` and runs until the process
/// is terminated.
pub async fn run_server(assistant: Arc<Assistant>) -> anyhow::Result<()> {
    let bind_addr = assistant.config().server.bind.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/events", post(handle_event))
        .route("/chat", post(handle_chat))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { assistant });

    println!("triage server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

/// Map a pipeline error onto an HTTP status, keeping its category as the
/// machine-readable code.
fn pipeline_error(err: AssistError) -> AppError {
    let status = match &err {
        AssistError::NotFound(_) => StatusCode::NOT_FOUND,
        AssistError::Encoding(_) | AssistError::Scoring(_) | AssistError::Config(_) => {
            StatusCode::BAD_REQUEST
        }
        AssistError::IndexEmpty | AssistError::Assembly(_) => StatusCode::CONFLICT,
        AssistError::Generation(_) => StatusCode::GATEWAY_TIMEOUT,
        AssistError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AssistError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    AppError {
        status,
        code: err.category().to_string(),
        message: err.to_string(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /status ============

async fn handle_status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = state.assistant.status().await.map_err(pipeline_error)?;
    Ok(Json(serde_json::to_value(status).unwrap_or_default()))
}

// ============ POST /events ============

/// Accepts a raw event `{source, payload, timestamp, event_id?}`, runs the
/// full event flow, and returns the resulting report. A pipeline failure
/// after scoring also posts a failure notice to the chat channel, so
/// operators are never left with silence.
async fn handle_event(
    State(state): State<AppState>,
    Json(event): Json<RawEvent>,
) -> Result<Json<serde_json::Value>, AppError> {
    if event.payload.trim().is_empty() {
        return Err(bad_request("event payload must not be empty"));
    }

    match state.assistant.handle_event(&event).await {
        Ok(report) => Ok(Json(serde_json::to_value(report).unwrap_or_default())),
        Err(err) => {
            error!(error = %err, "event flow failed");
            state.assistant.notify_failure("event", &err).await;
            Err(pipeline_error(err))
        }
    }
}

// ============ POST /chat ============

/// Accepts an operator message `{text, sender, channel}` and returns the
/// assistant's reply. When a signing secret is configured, the request
/// must carry a valid signature; verification happens against the raw
/// body before it is parsed.
async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let body_str = std::str::from_utf8(&body)
        .map_err(|_| bad_request("request body must be valid UTF-8"))?;

    if let Some(secret) = &state.assistant.config().notify.signing_secret {
        let timestamp = header_str(&headers, "x-triage-timestamp")
            .ok_or_else(|| unauthorized("missing x-triage-timestamp header"))?;
        let signature = header_str(&headers, "x-triage-signature")
            .ok_or_else(|| unauthorized("missing x-triage-signature header"))?;
        if !verify_signature(secret, timestamp, body_str, signature, Utc::now().timestamp()) {
            return Err(unauthorized("signature verification failed"));
        }
    }

    let message: OperatorMessage =
        serde_json::from_str(body_str).map_err(|e| bad_request(format!("invalid body: {}", e)))?;
    if message.text.trim().is_empty() {
        return Err(bad_request("message text must not be empty"));
    }

    match state.assistant.handle_message(&message).await {
        Ok(reply) => Ok(Json(serde_json::to_value(reply).unwrap_or_default())),
        Err(err) => {
            error!(error = %err, "chat flow failed");
            Err(pipeline_error(err))
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
