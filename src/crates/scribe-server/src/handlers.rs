//! Request handlers for the run API.

use crate::error::{Result, ServerError};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use scribe_core::event::SubscriberItem;
use scribe_core::viz::{render, VizFormat};
use scribe_core::{Mode, NodeStatus, RunState, ScribeConfig, TokenUsage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use tracing::{info, instrument};

/// Body of the start endpoints.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub prompt: String,
    /// Capability name used for every role when set.
    #[serde(default)]
    pub model: Option<String>,
    /// Provider credentials, passed through to capability implementations
    /// at registration time; the engine itself never reads them.
    #[serde(default)]
    #[allow(dead_code)]
    pub api_keys: Option<HashMap<String, String>>,
    #[serde(default)]
    pub enable_search: Option<bool>,
    #[serde(default)]
    pub search_backend: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub run_id: String,
}

#[derive(Debug, Serialize)]
pub struct Progress {
    pub percent: f32,
}

/// Status payload: `{ status, progress.percent, root_status, ... }`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: RunState,
    pub progress: Progress,
    pub root_status: NodeStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_node_nid: Option<String>,
    pub usage: TokenUsage,
}

#[derive(Debug, Serialize)]
pub struct ResultResponse {
    pub result: String,
}

#[derive(Debug, Serialize)]
pub struct WorkspaceResponse {
    pub article: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    #[serde(default)]
    pub from_sequence: u64,
}

fn start_run(state: &AppState, mode: Mode, request: StartRequest) -> Result<Json<StartResponse>> {
    if request.prompt.trim().is_empty() {
        return Err(ServerError::BadRequest("prompt must not be empty".into()));
    }

    let mut config = ScribeConfig::for_mode(mode);
    if let Some(model) = &request.model {
        config.models.plan = model.clone();
        config.models.execute = model.clone();
        config.models.aggregate = model.clone();
    }
    if request.enable_search.unwrap_or(false) {
        let backend = request
            .search_backend
            .clone()
            .unwrap_or_else(|| "search".to_string());
        config = config.with_search_backend(backend);
    }

    let run_id = state.manager.start(request.prompt, mode, Some(config))?;
    info!(run_id = %run_id, mode = %mode, "run accepted");
    Ok(Json(StartResponse { run_id }))
}

/// `POST /api/generate-story`
#[instrument(skip(state, request))]
pub async fn generate_story(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>> {
    start_run(&state, Mode::Story, request)
}

/// `POST /api/generate-report`
#[instrument(skip(state, request))]
pub async fn generate_report(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>> {
    start_run(&state, Mode::Report, request)
}

/// `GET /api/status/:run_id`
pub async fn status(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<StatusResponse>> {
    let status = state.manager.status(&run_id)?;
    Ok(Json(StatusResponse {
        status: status.status,
        progress: Progress {
            percent: status.progress_percent,
        },
        root_status: status.root_status,
        started_at: status.started_at,
        updated_at: status.updated_at,
        error_kind: status.error_kind,
        error_message: status.error_message,
        failing_node_nid: status.failing_node_nid,
        usage: status.usage,
    }))
}

/// `GET /api/result/:run_id`
pub async fn result(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<ResultResponse>> {
    match state.manager.result(&run_id)? {
        Some(result) => Ok(Json(ResultResponse { result })),
        None => Err(ServerError::NotFinished(run_id)),
    }
}

#[derive(Debug, Deserialize)]
pub struct GraphQuery {
    /// `json` (default), `dot`, or `mermaid`.
    #[serde(default)]
    pub format: Option<String>,
}

/// `GET /api/task-graph/:run_id?format=json|dot|mermaid`
pub async fn task_graph(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<GraphQuery>,
) -> Result<Response> {
    let view = state.manager.graph(&run_id)?;
    match query.format.as_deref() {
        None | Some("json") => Ok(Json(view).into_response()),
        Some("dot") => Ok(render(&view, VizFormat::Dot).into_response()),
        Some("mermaid") => Ok(render(&view, VizFormat::Mermaid).into_response()),
        Some(other) => Err(ServerError::BadRequest(format!(
            "unknown graph format '{other}'"
        ))),
    }
}

/// `GET /api/workspace/:run_id`
pub async fn workspace(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<WorkspaceResponse>> {
    Ok(Json(WorkspaceResponse {
        article: state.manager.article(&run_id)?,
    }))
}

/// `POST /api/stop-task/:run_id`
pub async fn stop_task(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.manager.cancel(&run_id)?;
    Ok(Json(serde_json::json!({ "cancelled": run_id })))
}

/// `DELETE /api/delete-task/:run_id`
pub async fn delete_task(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.manager.delete_run(&run_id)?;
    Ok(Json(serde_json::json!({ "deleted": run_id })))
}

/// `GET /api/history`
pub async fn history(State(state): State<AppState>) -> Json<serde_json::Value> {
    let runs = state.manager.list_runs();
    Json(serde_json::json!({ "runs": runs }))
}

/// `GET /api/events/:run_id?from_sequence=N`
///
/// SSE stream of serialized engine events: replay from the requested
/// sequence, then live. A lagging consumer receives a terminal `lagged`
/// event and is expected to reconnect with replay.
pub async fn events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<SubscribeQuery>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let stream = state.manager.subscribe(&run_id, query.from_sequence)?;
    let stream = stream.map(|item| {
        let event = match item {
            SubscriberItem::Event(record) => Event::default()
                .event("engine")
                .json_data(&*record)
                .unwrap_or_else(|_| Event::default().event("engine").data("{}")),
            SubscriberItem::Lagged { missed } => Event::default()
                .event("lagged")
                .data(missed.to_string()),
        };
        Ok(event)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
