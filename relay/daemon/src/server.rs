//! HTTP API
//!
//! ```text
//! POST /api/v1/sessions                     create from a prompt (creator holds one ref)
//! GET  /api/v1/sessions                     list ids
//! GET  /api/v1/sessions/{id}                status, lsn, ref_count
//! POST /api/v1/sessions/{id}/acquire        ref_count += 1
//! POST /api/v1/sessions/{id}/release        ref_count -= 1
//! POST /api/v1/sessions/{id}/abort          stop the producer
//! GET  /api/v1/sessions/{id}/stream?from=n  NDJSON frames after lsn n
//! GET  /api/v1/summary                      counts by status
//! GET  /livez
//! GET  /readyz                              producer reachable
//! ```
//!
//! A stream request holds its own reference for as long as the response
//! body is alive. When the client disconnects, hyper drops the body and the
//! reference is released; the producer keeps running.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use relay_core::{
    pull_stream, AcquireOptions, LlmBackend, LlmRequest, Lsn, NdjsonBridge, RegistrySummary,
    RelayError, SessionId, SessionInfo, SessionRegistry, SessionStatus, NDJSON_CONTENT_TYPE,
};

// ============================================================================
// Application State
// ============================================================================

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    /// Sessions served by this daemon
    pub registry: SessionRegistry<String>,
    /// Producer for new sessions
    pub backend: Arc<dyn LlmBackend>,
    /// Model used when a request does not name one
    pub default_model: String,
    /// Ids whose producer is being started by a create request
    creating: Arc<DashSet<SessionId>>,
}

impl AppState {
    /// State over a registry and a producer
    pub fn new(
        registry: SessionRegistry<String>,
        backend: Arc<dyn LlmBackend>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            backend,
            default_model: default_model.into(),
            creating: Arc::new(DashSet::new()),
        }
    }
}

/// Claim on a session id while its producer starts
///
/// Only one create request per id gets past [`CreateClaim::take`], so a
/// losing request never calls the producer. The claim ends when dropped,
/// including when the request is cancelled.
struct CreateClaim {
    creating: Arc<DashSet<SessionId>>,
    id: SessionId,
}

impl CreateClaim {
    fn take(creating: &Arc<DashSet<SessionId>>, id: &SessionId) -> Option<Self> {
        creating.insert(id.clone()).then(|| Self {
            creating: Arc::clone(creating),
            id: id.clone(),
        })
    }
}

impl Drop for CreateClaim {
    fn drop(&mut self) {
        self.creating.remove(&self.id);
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("registry", &self.registry)
            .field("backend", &self.backend.name())
            .field("default_model", &self.default_model)
            .field("creating", &self.creating.len())
            .finish()
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// Body of `POST /api/v1/sessions`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Prompt handed to the producer
    pub prompt: String,
    /// Model, defaulting to the daemon's configured model
    #[serde(default)]
    pub model: Option<String>,
    /// System prompt
    #[serde(default)]
    pub system: Option<String>,
    /// Sampling temperature, clamped to 0.0..=1.0
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Generation limit
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Caller-chosen id; generated when absent
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

/// Response of `POST /api/v1/sessions`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    /// Id to acquire, stream, and release
    pub session_id: SessionId,
    /// Writer status at creation
    pub status: SessionStatus,
}

/// Response of `GET /api/v1/sessions`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSessionsResponse {
    /// Registered ids, sorted
    pub sessions: Vec<SessionId>,
}

/// Query of the stream endpoint
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Resume after this LSN
    #[serde(default)]
    pub from: Lsn,
}

/// JSON body of every error response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable message
    pub error: String,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors a handler can return
#[derive(Debug, Error)]
pub enum ApiError {
    /// Session-level failure from the registry
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// The producer could not be started
    #[error("producer unavailable: {0}")]
    Backend(String),

    /// Malformed request
    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl ApiError {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Relay(RelayError::SessionNotFound(_) | RelayError::MissingSource(_)) => {
                StatusCode::NOT_FOUND
            }
            Self::Relay(RelayError::SessionExists(_) | RelayError::BufferClosed(_)) => {
                StatusCode::CONFLICT
            }
            Self::Relay(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Backend(_) => StatusCode::BAD_GATEWAY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Build the daemon's router
pub fn build_app(state: AppState) -> Router {
    let api_v1 = Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{session_id}", get(get_session))
        .route("/sessions/{session_id}/acquire", post(acquire_session))
        .route("/sessions/{session_id}/release", post(release_session))
        .route("/sessions/{session_id}/abort", post(abort_session))
        .route("/sessions/{session_id}/stream", get(stream_session))
        .route("/summary", get(summary))
        .with_state(state.clone());

    Router::new()
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .with_state(state)
        .nest("/api/v1", api_v1)
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /livez
pub async fn livez() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// GET /readyz
pub async fn readyz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.backend.health_check().await {
        (StatusCode::OK, "ok")
    } else {
        tracing::warn!(backend = state.backend.name(), "Producer unreachable");
        (StatusCode::SERVICE_UNAVAILABLE, "producer unavailable")
    }
}

/// POST /api/v1/sessions
async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".to_string()));
    }

    let id = req.session_id.unwrap_or_default();
    let Some(_claim) = CreateClaim::take(&state.creating, &id) else {
        tracing::debug!(session_id = %id, "Create already in flight");
        return Err(RelayError::SessionExists(id).into());
    };
    if state.registry.contains(&id).await {
        return Err(RelayError::SessionExists(id).into());
    }

    let model = req.model.unwrap_or_else(|| state.default_model.clone());
    let mut request = LlmRequest::new(req.prompt, model);
    if let Some(system) = req.system {
        request = request.with_system(system);
    }
    if let Some(temperature) = req.temperature {
        request = request.with_temperature(temperature);
    }
    if let Some(max_tokens) = req.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }

    let source = state
        .backend
        .stream_tokens(&request)
        .await
        .map_err(|e| ApiError::Backend(format!("{e:#}")))?;
    let handle = state
        .registry
        .acquire(&id, AcquireOptions::create(source))
        .await?;

    tracing::info!(
        session_id = %id,
        model = %request.model,
        backend = state.backend.name(),
        "Session started"
    );
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: id,
            status: handle.status(),
        }),
    ))
}

/// GET /api/v1/sessions
async fn list_sessions(State(state): State<AppState>) -> Json<ListSessionsResponse> {
    Json(ListSessionsResponse {
        sessions: state.registry.session_ids().await,
    })
}

/// GET /api/v1/sessions/{session_id}
async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let id = SessionId::from(session_id);
    session_info(&state, id).await
}

/// POST /api/v1/sessions/{session_id}/acquire
async fn acquire_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let id = SessionId::from(session_id);
    state.registry.acquire(&id, AcquireOptions::existing()).await?;
    session_info(&state, id).await
}

/// POST /api/v1/sessions/{session_id}/release
///
/// Releasing an unknown session is not an error.
async fn release_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.release(&SessionId::from(session_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/sessions/{session_id}/abort
async fn abort_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let id = SessionId::from(session_id);
    if !state.registry.contains(&id).await {
        return Err(RelayError::SessionNotFound(id).into());
    }
    if state.registry.abort(&id).await {
        if let Some(handle) = state.registry.handle(&id).await {
            handle.wait_until_settled().await;
        }
    }
    session_info(&state, id).await
}

/// GET /api/v1/sessions/{session_id}/stream?from={lsn}
async fn stream_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let id = SessionId::from(session_id);
    let lease = state
        .registry
        .lease(&id, AcquireOptions::existing())
        .await?;

    let span = tracing::info_span!("stream", session_id = %id, from_lsn = query.from);
    span.in_scope(|| tracing::debug!("Stream opened"));

    let frames = pull_stream(lease.handle().buffer().clone(), query.from);
    let bridge = NdjsonBridge::new(frames).with_lease(lease).with_span(span);

    Ok((
        [
            (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(bridge),
    )
        .into_response())
}

/// GET /api/v1/summary
async fn summary(State(state): State<AppState>) -> Json<RegistrySummary> {
    Json(state.registry.summary().await)
}

async fn session_info(state: &AppState, id: SessionId) -> Result<Json<SessionInfo>, ApiError> {
    match state.registry.info(&id).await {
        Some(info) => Ok(Json(info)),
        None => Err(RelayError::SessionNotFound(id).into()),
    }
}
