use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::events;
use crate::errors::{OrchestratorError, PoolError, StoreError};
use crate::orchestrator::PhaseService;
use crate::phase::Phase;
use crate::pool::ScraperPool;
use crate::progress::ProgressHub;

/// Caller identity header. Authentication happens in front of this service.
pub const USER_HEADER: &str = "x-user-id";
const ANONYMOUS: &str = "anonymous";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: PhaseService,
    pub pool: ScraperPool,
    pub hub: Arc<ProgressHub>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub domain: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvokePhaseRequest {
    #[serde(default)]
    pub input: Value,
    /// Scraping engine settings; merged into `input.engine`.
    #[serde(default)]
    pub engine: Option<Value>,
}

impl InvokePhaseRequest {
    fn parse(body: &[u8]) -> Result<Self, ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|e| ApiError::Unprocessable(format!("Invalid request body: {}", e)))
    }

    fn into_input(self) -> Result<Value, ApiError> {
        let Some(engine) = self.engine else {
            return Ok(self.input);
        };
        let mut input = match self.input {
            Value::Null => serde_json::Map::new(),
            Value::Object(map) => map,
            _ => {
                return Err(ApiError::Unprocessable(
                    "`input` must be an object when `engine` is given".into(),
                ));
            }
        };
        input.insert("engine".into(), engine);
        Ok(Value::Object(input))
    }
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Orchestrator(OrchestratorError),
    Store(StoreError),
    Unprocessable(String),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError::Orchestrator(err)
    }
}

fn pool_error(err: &OrchestratorError) -> Option<&PoolError> {
    match err {
        OrchestratorError::PhaseExecution { source, .. } => source.downcast_ref::<PoolError>(),
        _ => None,
    }
}

fn orchestrator_status(err: &OrchestratorError) -> StatusCode {
    if let Some(pool_err) = pool_error(err) {
        return match pool_err {
            PoolError::AcquireTimeout { .. } | PoolError::PoolExhausted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PoolError::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PoolError::EngineLaunch { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
    }
    match err {
        OrchestratorError::NotFound { .. } => StatusCode::NOT_FOUND,
        OrchestratorError::PhaseBlocked { .. }
        | OrchestratorError::PhaseInProgress { .. }
        | OrchestratorError::PhaseAlreadyApproved { .. } => StatusCode::CONFLICT,
        OrchestratorError::NoWorker { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::PhaseTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut unsaved = None;
        let (status, stage, code, message) = match self {
            ApiError::Orchestrator(err) => {
                let (err, persistence) = err.split_unsaved();
                unsaved = persistence;
                let status = orchestrator_status(&err);
                let code = match pool_error(&err) {
                    Some(PoolError::AcquireTimeout { .. }) => "pool_timeout",
                    Some(PoolError::PoolExhausted) => "pool_exhausted",
                    _ => err.code(),
                };
                if status.is_server_error() {
                    tracing::error!(stage = err.stage(), code, error = %err, "request failed");
                }
                (status, err.stage(), code, err.to_string())
            }
            ApiError::Store(err) => {
                let (status, code) = match &err {
                    StoreError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
                    StoreError::InvalidInput(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_input"),
                    StoreError::Persistence(_) => {
                        tracing::error!(error = %err, "session store failure");
                        (StatusCode::INTERNAL_SERVER_ERROR, "persistence_error")
                    }
                };
                (status, "load", code, err.to_string())
            }
            ApiError::Unprocessable(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "request", "invalid_request", msg)
            }
        };
        let mut body = json!({
            "status": "failed",
            "stage": stage,
            "code": code,
            "error": message,
        });
        if let Some(persistence) = unsaved {
            tracing::error!(error = %persistence, "failed status was not saved");
            body["persist_error"] = json!(persistence.to_string());
        }
        (status, Json(body)).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/phases/{phase}", post(invoke_phase))
        .route("/api/sessions/{id}/save", post(save_session))
        .route("/api/sessions/{id}/events", get(events::session_events))
        .route("/api/pool", get(pool_stats))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

pub(super) fn user_id(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string()
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_session(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = user_id(&headers);
    let session = state
        .service
        .pipeline()
        .store()
        .get_or_create_session(&user, &req.domain)
        .await
        .map_err(ApiError::Store)?;
    state.hub.create_or_get_session(&session.id);
    tracing::info!(session_id = %session.id, domain = %session.domain, "session ready");
    Ok(Json(session))
}

async fn get_session(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .service
        .pipeline()
        .store()
        .get_session(&id, &user_id(&headers))
        .await
        .map_err(ApiError::Store)?;
    Ok(Json(session))
}

async fn invoke_phase(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((id, phase)): Path<(String, String)>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let phase: Phase = phase
        .parse()
        .map_err(|e: anyhow::Error| ApiError::Unprocessable(e.to_string()))?;
    let input = InvokePhaseRequest::parse(&body)?.into_input()?;
    let invocation = state
        .service
        .invoke(&id, &user_id(&headers), phase, input)
        .await?;
    Ok(Json(invocation))
}

async fn save_session(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.service.retry_save(&id, &user_id(&headers)).await?;
    Ok(Json(session))
}

async fn pool_stats(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.pool.stats())
}
