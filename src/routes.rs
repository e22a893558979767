use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::stream::Stream;
use parking_lot::RwLock;
use serde_json::json;
use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Duration};
use thiserror::Error;
use tokio_stream::{wrappers::WatchStream, StreamExt};
use uuid::Uuid;

use crate::{
    gemini::ImageBackend,
    models::{PromptRequest, SessionSnapshot},
    session::{IgnoreReason, Session, SessionError, SubmitOutcome},
};

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<RwLock<HashMap<Uuid, Arc<Session>>>>,
    pub backend: Arc<dyn ImageBackend>,
    pub history_limit: Option<usize>,
}

impl AppState {
    pub fn new(backend: Arc<dyn ImageBackend>, history_limit: Option<usize>) -> Self {
        Self { sessions: Arc::default(), backend, history_limit }
    }

    fn session(&self, id: Uuid) -> Result<Arc<Session>, ApiError> {
        self.sessions.read().get(&id).cloned().ok_or(ApiError::SessionNotFound(id))
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("a request is already in progress")]
    Busy,
    #[error("no image to download")]
    NoImage,
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::SessionNotFound(_) | ApiError::Session(_) | ApiError::NoImage => StatusCode::NOT_FOUND,
            ApiError::EmptyPrompt => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Busy => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        .route("/api/sessions/:id/prompt", post(submit_prompt))
        .route("/api/sessions/:id/clear", post(clear_session))
        .route("/api/sessions/:id/history/:item_id/select", post(select_history))
        .route("/api/sessions/:id/image", get(download_image))
        .route("/api/sessions/:id/events", get(session_events))
        .with_state(state)
}

pub async fn create_session(State(state): State<AppState>) -> (StatusCode, Json<SessionSnapshot>) {
    let session = Arc::new(Session::new(state.backend.clone(), state.history_limit));
    let snapshot = session.snapshot();
    state.sessions.write().insert(session.id(), session);
    tracing::info!(session = %snapshot.id, "🎨 Session created");
    (StatusCode::CREATED, Json(snapshot))
}

pub async fn get_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(state.session(id)?.snapshot()))
}

pub async fn delete_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.sessions.write().remove(&id).ok_or(ApiError::SessionNotFound(id))?;
    tracing::info!(session = %id, "Session ended");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn submit_prompt(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<PromptRequest>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let session = state.session(id)?;
    tracing::info!(session = %id, status = ?session.status(), "🚀 Prompt submitted: {}", body.prompt);

    // Once dispatched, a request runs to completion even if the caller goes away.
    let outcome = tokio::spawn({
        let session = session.clone();
        async move { session.submit(&body.prompt).await }
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    match outcome {
        SubmitOutcome::Completed(item) => {
            tracing::info!(session = %id, item = item.id, "✅ Image ready");
        }
        SubmitOutcome::Failed(message) => {
            tracing::error!(session = %id, "❌ Prompt failed: {}", message);
        }
        SubmitOutcome::Ignored(IgnoreReason::Busy) => return Err(ApiError::Busy),
        SubmitOutcome::Ignored(IgnoreReason::EmptyPrompt) => return Err(ApiError::EmptyPrompt),
    }
    Ok(Json(session.snapshot()))
}

pub async fn clear_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<SessionSnapshot>, ApiError> {
    let session = state.session(id)?;
    session.clear();
    Ok(Json(session.snapshot()))
}

pub async fn select_history(
    Path((id, item_id)): Path<(Uuid, u64)>,
    State(state): State<AppState>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let session = state.session(id)?;
    session.select_history(item_id)?;
    Ok(Json(session.snapshot()))
}

pub async fn download_image(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Response, ApiError> {
    let image = state.session(id)?.snapshot().image.ok_or(ApiError::NoImage)?;

    let filename = format!("zencanvas-{}.{}", Utc::now().timestamp_millis(), image.file_extension());
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(image.mime_type()).unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok((StatusCode::OK, headers, image.bytes().clone()).into_response())
}

pub async fn session_events(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = state.session(id)?;
    let stream = WatchStream::new(session.subscribe()).map(|snapshot| {
        let event = Event::default()
            .event("state")
            .json_data(&snapshot)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
        Ok(event)
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}
