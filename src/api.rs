//! REST API server for the advisory agent
//!
//! OpenAI-compatible surface: `POST /v1/chat/completions` (SSE or a single
//! JSON object) and `GET /v1/models`, both behind a bearer token, plus
//! unauthenticated liveness routes.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::agent::{Orchestrator, TurnRequest};
use crate::error::OrchestrationError;
use crate::stream::{ChunkEncoder, CompletionCollector};
use crate::stream::emitter::ErrorEvent;

const IDEMPOTENCY_KEY: &str = "idempotency-key";

//
// ================= Request Models =================
//

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Accepted for client compatibility; sampling is configured server-side.
    #[serde(default)]
    pub temperature: Option<f32>,
}

fn default_stream() -> bool {
    true
}

impl ChatCompletionRequest {
    /// `thread_id`, else `user`, else a fresh anonymous id.
    pub fn thread_identity(&self) -> String {
        [self.thread_id.as_deref(), self.user.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                let id = uuid::Uuid::new_v4().simple().to_string();
                format!("anonymous-{}", &id[..8])
            })
    }

    pub fn latest_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }
}

//
// ================= API State =================
//

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub api_token: Arc<str>,
    pub model_name: Arc<str>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, api_token: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            orchestrator,
            api_token: Arc::from(api_token.into()),
            model_name: Arc::from(model_name.into()),
        }
    }
}

//
// ================= Errors =================
//

impl IntoResponse for OrchestrationError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            OrchestrationError::AuthError(_) => (StatusCode::UNAUTHORIZED, "authentication_error"),
            OrchestrationError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = serde_json::json!({
            "error": { "message": self.to_string(), "type": kind }
        });
        (status, Json(body)).into_response()
    }
}

//
// ================= Middleware =================
//

/// Reject requests without `Authorization: Bearer <API_TOKEN>` before any
/// handler runs.
async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .map(|token| tokens_match(token, &state.api_token));

    match presented {
        Some(true) => next.run(request).await,
        Some(false) => {
            warn!(path = %request.uri().path(), "Rejected request with invalid token");
            OrchestrationError::AuthError("invalid bearer token".into()).into_response()
        }
        None => OrchestrationError::AuthError("missing bearer token".into()).into_response(),
    }
}

/// Token from an `Authorization` value; the scheme is case-insensitive.
fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

/// Compare fixed-length digests so the time taken does not depend on where
/// the tokens differ.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    presented
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

//
// ================= Handlers =================
//

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn service_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "model": &*state.model_name,
        "endpoints": ["/v1/chat/completions", "/v1/models", "/health"]
    }))
}

async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "object": "list",
        "data": [{
            "id": &*state.model_name,
            "object": "model",
            "created": 0,
            "owned_by": env!("CARGO_PKG_NAME")
        }]
    }))
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatCompletionRequest>,
) -> Response {
    let Some(message) = req.latest_user_message() else {
        return OrchestrationError::InvalidRequest("no user message found".into()).into_response();
    };
    if message.trim().is_empty() {
        return OrchestrationError::InvalidRequest("user message is empty".into()).into_response();
    }

    let mut turn = TurnRequest::new(req.thread_identity(), message);
    turn.turn_key = headers
        .get(IDEMPOTENCY_KEY)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string);

    info!(
        thread_id = %turn.thread_id,
        stream = req.stream,
        explicit_key = turn.turn_key.is_some(),
        "Chat completion requested"
    );
    if let Some(temperature) = req.temperature {
        debug!(temperature, "Ignoring client temperature");
    }

    let events = state.orchestrator.handle_turn(turn);

    if req.stream {
        stream_response(events, &state.model_name).into_response()
    } else {
        collect_response(events, &state.model_name).await
    }
}

fn stream_response(
    events: crate::agent::TurnStream,
    model: &str,
) -> Sse<impl futures::Stream<Item = std::result::Result<Event, Infallible>> + Send + 'static> {
    let mut encoder = ChunkEncoder::new(model);
    let frames = ReceiverStream::new(events).flat_map(move |event| {
        let frames = encoder.encode(&event);
        futures::stream::iter(
            frames
                .into_iter()
                .map(|frame| Ok(Event::default().data(frame.data()))),
        )
    });

    Sse::new(frames).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
}

async fn collect_response(mut events: crate::agent::TurnStream, model: &str) -> Response {
    let mut collector = CompletionCollector::new();
    while let Some(event) = events.recv().await {
        collector.push(event);
    }

    match collector.finish(model) {
        Ok(completion) => (StatusCode::OK, Json(completion)).into_response(),
        Err(failure) => {
            warn!(kind = failure.kind.as_str(), error = %failure.message, "Turn failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorEvent::from(&failure))).into_response()
        }
    }
}

//
// ================= Router =================
//

pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

//
// ================= Server Startup =================
//

pub async fn start_server(state: AppState, host: &str, port: u16) -> crate::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind((host, port)).await?;

    info!(%host, port, "API server listening");
    axum::serve(listener, router).await?;
    Ok(())
}
