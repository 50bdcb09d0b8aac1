//! HTTP server implementation using Axum.

use crate::command::resolve_command;
use crate::error::BoxError;
use crate::flags::RunConfig;
use crate::meta::RunResult;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

type ApiError = (StatusCode, String);

// Request/Response types
#[derive(Serialize)]
struct BoxInfo {
    id: u32,
    root: String,
}

#[derive(Deserialize)]
struct WriteFileRequest {
    path: String,
    /// Base64 encoded file content.
    content: String,
    #[serde(default = "default_mode")]
    mode: u32,
}

fn default_mode() -> u32 { 0o644 }

#[derive(Deserialize)]
struct FileQuery {
    path: String,
}

#[derive(Serialize)]
struct FileContent {
    content: String,
}

#[derive(Serialize)]
struct FileExists {
    exists: bool,
}

#[derive(Deserialize)]
struct RunRequest {
    command: Vec<String>,
    #[serde(default)]
    config: RunConfig,
    /// Resolve the program on the host PATH before running.
    #[serde(default)]
    resolve: bool,
    /// Abandon the run after this long. Box limits still apply on their own.
    timeout_ms: Option<u64>,
}

#[derive(Serialize)]
struct VersionResponse {
    isolate: String,
}

/// Builds the router for the given state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/boxes", get(list_boxes))
        .route("/boxes/:id", post(create_box).get(get_box).delete(delete_box))
        .route("/boxes/:id/files", post(write_file).get(read_file))
        .route("/boxes/:id/files/exists", get(file_exists))
        .route("/boxes/:id/run", post(run_command))
        .route("/version", get(version))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

fn api_error(e: BoxError) -> ApiError {
    let status = match &e {
        BoxError::EmptyCommand | BoxError::InvalidPath(_) | BoxError::CommandLookup { .. } => {
            StatusCode::BAD_REQUEST
        }
        BoxError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        BoxError::Cancelled => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn box_not_found(id: u32) -> ApiError {
    (StatusCode::NOT_FOUND, format!("Box {id} not found"))
}

async fn health() -> &'static str {
    "OK"
}

async fn version(State(state): State<AppState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        isolate: state.manager.isolate_version().await,
    })
}

async fn list_boxes(State(state): State<AppState>) -> Json<Vec<BoxInfo>> {
    let boxes = state.boxes.read().await;
    let mut list: Vec<BoxInfo> = boxes
        .values()
        .map(|b| BoxInfo {
            id: b.id(),
            root: b.root().display().to_string(),
        })
        .collect();
    list.sort_by_key(|b| b.id);
    Json(list)
}

async fn create_box(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<(StatusCode, Json<BoxInfo>), ApiError> {
    let reservation = state
        .reserve(id)
        .await
        .ok_or_else(|| (StatusCode::CONFLICT, format!("Box {id} already exists")))?;

    let handle = state.manager.create(id).await.map_err(api_error)?;
    let handle = reservation.register(handle).await;
    let info = BoxInfo {
        id,
        root: handle.root().display().to_string(),
    };
    info!("Created box: {}", id);

    Ok((StatusCode::CREATED, Json(info)))
}

async fn get_box(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<Json<BoxInfo>, ApiError> {
    let handle = state.get(id).await.ok_or_else(|| box_not_found(id))?;
    Ok(Json(BoxInfo {
        id,
        root: handle.root().display().to_string(),
    }))
}

async fn delete_box(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<StatusCode, ApiError> {
    let handle = state
        .boxes
        .write()
        .await
        .remove(&id)
        .ok_or_else(|| box_not_found(id))?;
    handle.close().await.map_err(api_error)?;
    info!("Deleted box: {}", id);
    Ok(StatusCode::NO_CONTENT)
}

async fn write_file(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    Json(req): Json<WriteFileRequest>,
) -> Result<StatusCode, ApiError> {
    let handle = state.get(id).await.ok_or_else(|| box_not_found(id))?;
    let content = STANDARD
        .decode(req.content.as_bytes())
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid base64: {e}")))?;
    handle
        .write_file(&req.path, content.as_slice(), req.mode)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn read_file(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    Query(query): Query<FileQuery>,
) -> Result<Json<FileContent>, ApiError> {
    let handle = state.get(id).await.ok_or_else(|| box_not_found(id))?;
    let content = handle.read_file(&query.path).await.map_err(api_error)?;
    Ok(Json(FileContent {
        content: STANDARD.encode(content),
    }))
}

async fn file_exists(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    Query(query): Query<FileQuery>,
) -> Result<Json<FileExists>, ApiError> {
    let handle = state.get(id).await.ok_or_else(|| box_not_found(id))?;
    Ok(Json(FileExists {
        exists: handle.file_exists(&query.path).await,
    }))
}

/// Responds with `null` when every attempt failed.
async fn run_command(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    Json(req): Json<RunRequest>,
) -> Result<Json<Option<RunResult>>, ApiError> {
    let handle = state.get(id).await.ok_or_else(|| box_not_found(id))?;
    let command = if req.resolve {
        resolve_command(&req.command).map_err(api_error)?
    } else {
        req.command
    };
    info!("POST /boxes/{}/run - command: {:?}", id, command);

    let cancel = CancellationToken::new();
    let deadline = req.timeout_ms.map(|ms| {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            cancel.cancel();
        })
    });

    let result = handle.run(&cancel, &command, &req.config).await;
    if let Some(deadline) = deadline {
        deadline.abort();
    }
    let result = result.map_err(api_error)?;

    match &result {
        Some(r) => info!("POST /boxes/{}/run - result: status={} exit={}", id, r.status, r.exit_code),
        None => info!("POST /boxes/{}/run - no result after retries", id),
    }
    Ok(Json(result))
}
