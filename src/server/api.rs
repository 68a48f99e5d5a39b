use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::stream;
use crate::consumer::GenerationState;
use crate::distributor::EventDistributor;
use crate::errors::{ServiceError, TriggerError};
use crate::events::ProgressEvent;
use crate::models::{ChatMessage, DurableEvent, FileMap};
use crate::service::IterationService;
use crate::store::{ConversationStore, SqliteStore};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: SqliteStore,
    pub distributor: Arc<EventDistributor>,
    pub service: IterationService,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SubmitIterationRequest {
    pub prompt: String,
}

/// Progress reported by a remote worker.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEventRequest {
    #[serde(default)]
    pub version_id: Option<String>,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveSnapshotRequest {
    pub files: FileMap,
    #[serde(default)]
    pub version_id: Option<String>,
    #[serde(default = "default_accepted")]
    pub accepted: bool,
}

fn default_accepted() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    #[serde(default)]
    pub version_id: Option<String>,
}

#[derive(Serialize)]
pub struct EventHistory {
    pub events: Vec<DurableEvent>,
    pub state: GenerationState,
}

#[derive(Serialize)]
pub struct SnapshotSaved {
    pub id: i64,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::EmptyPrompt => ApiError::BadRequest(err.to_string()),
            ServiceError::Trigger(TriggerError::QuestionWithMutation { .. }) => {
                ApiError::BadRequest(err.to_string())
            }
            other => ApiError::Internal(format!("{:#}", anyhow::Error::from(other))),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects/{id}/iterations", post(submit_iteration))
        .route(
            "/api/projects/{id}/events",
            get(list_events).post(publish_worker_event),
        )
        .route("/api/projects/{id}/snapshots", post(save_snapshot))
        .route(
            "/api/projects/{id}/snapshots/{snapshot_id}/accept",
            post(accept_snapshot),
        )
        .route("/api/projects/{id}/stream", get(stream::stream_handler))
        .route("/health", get(health_check))
}

fn validate_project_id(id: &str) -> Result<(), ApiError> {
    if id.trim().is_empty() {
        return Err(ApiError::BadRequest("Project id must not be empty".into()));
    }
    Ok(())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn submit_iteration(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<SubmitIterationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_project_id(&id)?;
    let submitted = state.service.submit(&id, &req.prompt).await?;
    Ok((StatusCode::ACCEPTED, Json(submitted)))
}

async fn publish_worker_event(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<WorkerEventRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_project_id(&id)?;
    debug!(project_id = %id, event_type = %req.event.event_type(), "worker event received");

    let runs = state.service.runs();
    if let Some(version_id) = req.version_id.as_deref()
        && req.event.mutates_files()
        && runs.allows_file_mutation(&id, version_id) == Some(false)
    {
        warn!(
            project_id = %id,
            version_id,
            event_type = %req.event.event_type(),
            "rejecting file event for non-mutating run"
        );
        return Err(ApiError::BadRequest(format!(
            "Run {} may not modify files",
            version_id
        )));
    }

    if let ProgressEvent::Complete { message } = &req.event
        && !message.is_empty()
        && let Err(e) = state
            .store
            .append_message(&id, ChatMessage::assistant(message.clone()))
            .await
    {
        warn!(project_id = %id, error = %format!("{:#}", e), "failed to record assistant reply");
    }

    let terminal = req.event.is_terminal();
    let envelope = state.distributor.publish(&id, req.event, req.version_id);
    if terminal && let Some(version_id) = envelope.version_id.as_deref() {
        runs.finish(&id, version_id);
    }
    Ok((StatusCode::ACCEPTED, Json(envelope)))
}

async fn list_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    validate_project_id(&id)?;
    let events = state
        .store
        .list_durable_events(&id, query.version_id.as_deref())
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
    let replayed = GenerationState::replay(&events);
    Ok(Json(EventHistory {
        events,
        state: replayed,
    }))
}

async fn save_snapshot(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<SaveSnapshotRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_project_id(&id)?;
    if req.files.is_empty() {
        return Err(ApiError::BadRequest("Snapshot must contain at least one file".into()));
    }
    let snapshot_id = state
        .store
        .save_snapshot(&id, req.version_id.as_deref(), req.files, req.accepted)
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
    Ok((StatusCode::CREATED, Json(SnapshotSaved { id: snapshot_id })))
}

/// Promote a draft snapshot so it becomes the context source.
async fn accept_snapshot(
    State(state): State<SharedState>,
    Path((id, snapshot_id)): Path<(String, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    validate_project_id(&id)?;
    let accepted = state
        .store
        .accept_snapshot(&id, snapshot_id)
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
    if !accepted {
        return Err(ApiError::NotFound(format!(
            "Snapshot {} not found for project {}",
            snapshot_id, id
        )));
    }
    Ok(Json(SnapshotSaved { id: snapshot_id }))
}
