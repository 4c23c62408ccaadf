use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

use crate::app::{CreateRunRequest, RunStatusView};
use crate::artifacts::ArtifactKind;
use crate::dispatch::{FlowRun, FlowRunFilter, FlowRunStatus};
use crate::engine::types::Answer;
use crate::flows::FlowRunRequest;

use super::AppState;
use super::errors::AppError;

// --- Request/Response types ---

#[derive(Serialize)]
pub struct FlowRunCreated {
    pub run_id: String,
    pub status: FlowRunStatus,
}

#[derive(Deserialize)]
pub struct ListFlowRunsQuery {
    pub status: Option<String>,
    pub flow_name: Option<String>,
    pub env: Option<String>,
    pub tag: Option<String>,
}

#[derive(Deserialize)]
pub struct CleanupQuery {
    pub retention_days: Option<u32>,
}

#[derive(Serialize)]
pub struct PluginInfo {
    pub feature_type: String,
    pub description: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Interactive runs ---

/// POST /runs
pub async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<RunStatusView>), AppError> {
    let view = state.orchestrator.create_interactive_run(req).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /runs
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let runs = state.orchestrator.list_runs().await?;
    Ok(Json(serde_json::json!({
        "total": runs.len(),
        "runs": runs,
    })))
}

/// GET /runs/:id
pub async fn run_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RunStatusView>, AppError> {
    Ok(Json(state.orchestrator.run_status(&id).await?))
}

/// GET /runs/:id/context
pub async fn run_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctx = state.orchestrator.get_run(&id).await?;
    let value = serde_json::to_value(&ctx).map_err(anyhow::Error::from)?;
    Ok(Json(value))
}

/// POST /runs/:id/answer
pub async fn submit_answer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(answer): Json<Answer>,
) -> Result<Json<RunStatusView>, AppError> {
    Ok(Json(state.orchestrator.submit_answer(&id, answer).await?))
}

/// GET /runs/:id/artifacts
pub async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let artifacts = state.orchestrator.list_artifacts(&id).await?;
    Ok(Json(serde_json::json!({
        "run_id": id,
        "total": artifacts.len(),
        "artifacts": artifacts,
    })))
}

/// GET /runs/:id/artifacts/*path
pub async fn get_artifact(
    State(state): State<Arc<AppState>>,
    Path((id, path)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let bytes = state.orchestrator.get_artifact(&id, &path).await?;
    let content_type = content_type_for(&path);
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

// --- Flow runs ---

/// GET /flows
pub async fn list_flows(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let flows = state.orchestrator.list_flows().await?;
    Ok(Json(serde_json::json!({
        "total": flows.len(),
        "flows": flows,
    })))
}

/// POST /flow-runs
pub async fn create_flow_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FlowRunRequest>,
) -> Result<(StatusCode, Json<FlowRunCreated>), AppError> {
    let run = state.orchestrator.create_flow_run(req).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(FlowRunCreated {
            run_id: run.run_id,
            status: run.status,
        }),
    ))
}

/// GET /flow-runs
pub async fn list_flow_runs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListFlowRunsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<FlowRunStatus>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let filter = FlowRunFilter {
        status,
        flow_name: params.flow_name,
        env: params.env,
        tag: params.tag,
    };

    let runs = state.orchestrator.list_flow_runs(&filter);
    Ok(Json(serde_json::json!({
        "total": runs.len(),
        "runs": runs,
    })))
}

/// GET /flow-runs/:id
pub async fn get_flow_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<FlowRun>, AppError> {
    Ok(Json(state.orchestrator.get_flow_run(&id)?))
}

/// POST /flow-runs/:id/cancel
pub async fn cancel_flow_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<FlowRun>, AppError> {
    Ok(Json(state.orchestrator.cancel_flow_run(&id).await?))
}

/// GET /rate-limit
pub async fn rate_limit_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = state.orchestrator.rate_limit_status();
    Json(serde_json::to_value(&status).unwrap_or_default())
}

/// POST /rate-limit/release-all
pub async fn force_release_all(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let released = state.orchestrator.force_release_all();
    Json(serde_json::json!({ "released": released }))
}

// --- Storage ---

/// GET /storage/stats
pub async fn storage_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let stats = state.orchestrator.storage_stats().await?;
    let value = serde_json::to_value(&stats).map_err(anyhow::Error::from)?;
    Ok(Json(value))
}

/// POST /storage/cleanup
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CleanupQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = state.orchestrator.sweep(params.retention_days).await?;
    Ok(Json(serde_json::json!({
        "removed": removed.len(),
        "run_ids": removed,
    })))
}

/// GET /plugins
pub async fn list_plugins(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let plugins: Vec<PluginInfo> = state
        .orchestrator
        .context()
        .plugins
        .list()
        .iter()
        .map(|(name, desc)| PluginInfo {
            feature_type: name.to_string(),
            description: desc.to_string(),
        })
        .collect();

    let total = plugins.len();
    Json(serde_json::json!({
        "plugins": plugins,
        "total": total,
    }))
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// --- Helpers ---

fn content_type_for(path: &str) -> &'static str {
    let ext = std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webm" => "video/webm",
        "mp4" => "video/mp4",
        "json" => "application/json",
        "html" => "text/html; charset=utf-8",
        "log" | "txt" => "text/plain; charset=utf-8",
        _ => match ArtifactKind::from_extension(&ext) {
            ArtifactKind::Screenshot => "image/png",
            _ => "application/octet-stream",
        },
    }
}
