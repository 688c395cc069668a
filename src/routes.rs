use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::hybrid::HybridGenerator;
use crate::jobs::JobRegistry;
use crate::models::{preview_path, GenerateRequest};
use crate::scene::{self, SceneDescription, ScenePlan};

const ANALYZE_SCENE_SECONDS: u32 = 5;

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobRegistry>,
    pub generator: Arc<HybridGenerator>,
    pub output_dir: Arc<PathBuf>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

pub async fn create_video(State(state): State<AppState>, Json(body): Json<GenerateRequest>) -> Response {
    let request = match body.into_video_request(&state.output_dir, Local::now()) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("🚫 Rejected request: {}", e);
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, e.to_string());
        }
    };
    tracing::info!("🚀 Video requested: \"{}\" ({}s, {:?})", request.prompt, request.duration, request.method);
    let snapshot = state.jobs.submit(state.generator.clone(), request);
    (StatusCode::ACCEPTED, Json(snapshot)).into_response()
}

pub async fn get_video(Path(id): Path<Uuid>, State(state): State<AppState>) -> Response {
    if let Some(job) = state.jobs.snapshot(id) { Json(job).into_response() } else { StatusCode::NOT_FOUND.into_response() }
}

/// Reads a file derived from a completed job's output path.
async fn completed_artifact(
    state: &AppState,
    id: Uuid,
    locate: fn(&std::path::Path) -> PathBuf,
) -> Result<(PathBuf, Vec<u8>), Response> {
    let output = match state.jobs.output_of(id) {
        None => return Err(StatusCode::NOT_FOUND.into_response()),
        Some(Err(status)) => return Err(error_response(StatusCode::CONFLICT, format!("job is {status}"))),
        Some(Ok(path)) => path,
    };
    let path = locate(&output);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok((path, bytes)),
        Err(e) => {
            tracing::warn!("❌ {} for job {} is unreadable: {}", path.display(), id, e);
            Err(StatusCode::NOT_FOUND.into_response())
        }
    }
}

pub async fn download_video(Path(id): Path<Uuid>, State(state): State<AppState>) -> Response {
    let (path, bytes) = match completed_artifact(&state, id, |output| output.to_path_buf()).await {
        Ok(found) => found,
        Err(response) => return response,
    };
    let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("video.mp4");
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
        ],
        bytes,
    )
        .into_response()
}

/// Contact sheet of evenly spaced frames; only local renders have one.
pub async fn preview_image(Path(id): Path<Uuid>, State(state): State<AppState>) -> Response {
    match completed_artifact(&state, id, preview_path).await {
        Ok((_, bytes)) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Err(response) => response,
    }
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub prompt: String,
    #[serde(default = "default_analyze_duration")]
    pub duration: u32,
}

fn default_analyze_duration() -> u32 {
    10
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub scene: SceneDescription,
    pub enhanced_prompt: String,
    pub scenes: Vec<ScenePlan>,
}

pub async fn analyze(Json(body): Json<AnalyzeRequest>) -> Json<AnalyzeResponse> {
    let scene = scene::analyze(&body.prompt, body.duration);
    let enhanced_prompt = scene::create_enhanced_prompt(&scene);
    let scenes = scene::split_into_scenes(&scene, ANALYZE_SCENE_SECONDS);
    tracing::info!("🔎 Analyzed \"{}\" into {} scenes", body.prompt, scenes.len());
    Json(AnalyzeResponse { scene, enhanced_prompt, scenes })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/videos", post(create_video))
        .route("/api/videos/:id", get(get_video))
        .route("/api/videos/:id/file", get(download_video))
        .route("/api/videos/:id/preview", get(preview_image))
        .route("/api/analyze", post(analyze))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}
