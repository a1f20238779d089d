//! HTTP routes: the hub's WebSocket endpoint and a thin JSON process API.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::hub::{EventHub, HubError, serve_client};
use crate::subprocess::{ErrorKind, ProcessInfo, ProcessOutput, ProcessSupervisor, SupervisorError};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub hub: EventHub,
    pub supervisor: Arc<ProcessSupervisor>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/processes", get(list_processes).post(start_process))
        .route("/processes/{id}", get(get_process).delete(remove_process))
        .route("/processes/{id}/output", get(process_output))
        .route("/processes/{id}/stop", post(stop_process))
        .route("/processes/{id}/kill", post(kill_process))
        .route(
            "/processes/{id}/input",
            post(send_input).delete(close_input),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// API error, rendered as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Supervisor(e) => match e.kind() {
                ErrorKind::Launch => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::InvalidState => StatusCode::CONFLICT,
            },
            Self::Hub(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub input: String,
}

/// `GET /ws`
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let max = state.hub.config().max_message_bytes;
    ws.max_message_size(max)
        .on_upgrade(move |socket| serve_client(socket, state.hub))
}

/// `GET /health`
async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// `GET /stats`
async fn stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let hub = state.hub.stats().await?;
    Ok(Json(json!({
        "clients": hub.clients,
        "channels": hub.channels,
        "processes": state.supervisor.len().await,
    })))
}

/// `GET /processes`
async fn list_processes(State(state): State<AppState>) -> Json<Vec<ProcessInfo>> {
    Json(state.supervisor.list().await)
}

/// `POST /processes`
async fn start_process(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> ApiResult<(StatusCode, Json<ProcessInfo>)> {
    let dir = request.dir.unwrap_or_default();
    let process = state
        .supervisor
        .start(&request.command, &request.args, dir)
        .await?;
    Ok((StatusCode::CREATED, Json(process.info().await)))
}

/// `GET /processes/{id}`
async fn get_process(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<ProcessInfo>> {
    Ok(Json(state.supervisor.get(&id).await?))
}

/// `DELETE /processes/{id}`
async fn remove_process(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<StatusCode> {
    state.supervisor.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /processes/{id}/output`
async fn process_output(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<ProcessOutput>> {
    Ok(Json(state.supervisor.output_info(&id).await?))
}

/// `POST /processes/{id}/stop`
async fn stop_process(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<ProcessInfo>> {
    state.supervisor.stop(&id).await?;
    Ok(Json(state.supervisor.get(&id).await?))
}

/// `POST /processes/{id}/kill`
async fn kill_process(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<StatusCode> {
    state.supervisor.kill(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// `POST /processes/{id}/input`
async fn send_input(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<InputRequest>,
) -> ApiResult<StatusCode> {
    state.supervisor.send_input(&id, &request.input).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /processes/{id}/input`
async fn close_input(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<StatusCode> {
    state.supervisor.close_input(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
