//! JSON control surface.
//!
//! Thin axum layer over the scheduler's operator actions and the status bus.

use crate::bus::StatusSnapshot;
use crate::catalog::{
    format_bytes, format_duration, format_resolution, CatalogError, Presentation, Status, VideoRecord,
};
use crate::scheduler::{ActionError, Scheduler};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use squeeze_config::SelectionConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Errors that can occur when running the control server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Handler-level error, rendered as `{ "error": ... }`.
#[derive(Debug)]
pub enum ApiError {
    Action(ActionError),
    Catalog(CatalogError),
    BadRequest(String),
}

impl From<ActionError> for ApiError {
    fn from(e: ActionError) -> Self {
        ApiError::Action(e)
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        ApiError::Catalog(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Action(e @ ActionError::NotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()),
            ApiError::Action(e @ ActionError::Busy(_)) => (StatusCode::CONFLICT, e.to_string()),
            ApiError::Action(ActionError::Catalog(e)) | ApiError::Catalog(e) => {
                tracing::error!(error = %e, "Catalog error in request");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (code, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub selection: SelectionConfig,
}

/// A record plus its display attributes.
#[derive(Debug, Serialize)]
pub struct VideoView {
    #[serde(flatten)]
    pub record: VideoRecord,
    pub presentation: Presentation,
    pub quality_ratio: Option<f64>,
    pub compression_factor: Option<f64>,
    pub size_original_display: String,
    pub size_compressed_display: String,
    pub duration_display: String,
    pub resolution_display: String,
}

impl From<VideoRecord> for VideoView {
    fn from(record: VideoRecord) -> Self {
        Self {
            presentation: record.status.presentation(),
            quality_ratio: record.quality_ratio(),
            compression_factor: record.compression_factor(),
            size_original_display: format_bytes(Some(record.size_original)),
            size_compressed_display: format_bytes(record.size_compressed),
            duration_display: format_duration(record.duration_seconds),
            resolution_display: format_resolution(record.width, record.height),
            record,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct VideosQuery {
    pub status: Option<Status>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub ids: Vec<Uuid>,
}

/// Overrides for the configured selection rule.
#[derive(Debug, Default, Deserialize)]
pub struct OverThresholdRequest {
    pub threshold: Option<f64>,
    pub min_file_size_mb: Option<u64>,
    pub min_file_age_hours: Option<f64>,
}

async fn get_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.scheduler.bus().snapshot())
}

async fn list_videos(
    State(state): State<AppState>,
    Query(query): Query<VideosQuery>,
) -> Result<Json<Vec<VideoView>>, ApiError> {
    let catalog = state.scheduler.catalog();
    let records = match query.status {
        Some(status) => catalog.list_by_status(status)?,
        None => catalog.list_all()?,
    };
    Ok(Json(records.into_iter().map(VideoView::from).collect()))
}

async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let queued = state.scheduler.enqueue(&request.ids)?;
    Ok(Json(json!({ "queued": queued })))
}

async fn enqueue_over_threshold(
    State(state): State<AppState>,
    request: Option<Json<OverThresholdRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let threshold = request.threshold.unwrap_or(state.selection.encoding_threshold);
    let min_size_mb = request.min_file_size_mb.unwrap_or(state.selection.min_file_size_mb);
    let min_age_hours = request
        .min_file_age_hours
        .unwrap_or(state.selection.min_file_age_hours)
        .max(0.0);

    let min_size_bytes = min_size_mb
        .checked_mul(1024 * 1024)
        .ok_or_else(|| ApiError::BadRequest(format!("min_file_size_mb out of range: {}", min_size_mb)))?;
    let min_age = Duration::try_from_secs_f64(min_age_hours * 3600.0)
        .map_err(|_| ApiError::BadRequest(format!("min_file_age_hours out of range: {}", min_age_hours)))?;

    let queued = state
        .scheduler
        .enqueue_over_threshold(threshold, min_size_bytes, min_age)?;
    Ok(Json(json!({ "queued": queued, "threshold": threshold })))
}

async fn cancel(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    state.scheduler.request_cancel();
    (StatusCode::ACCEPTED, Json(json!({ "cancelled": true })))
}

async fn keep(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<VideoView>, ApiError> {
    Ok(Json(state.scheduler.keep(&id)?.into()))
}

async fn reset(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<VideoView>, ApiError> {
    Ok(Json(state.scheduler.reset(&id)?.into()))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/videos", get(list_videos))
        .route("/videos/:id/keep", post(keep))
        .route("/videos/:id/reset", post(reset))
        .route("/enqueue", post(enqueue))
        .route("/enqueue/over-threshold", post(enqueue_over_threshold))
        .route("/cancel", post(cancel))
        .with_state(state)
}

/// Serves the control surface on `bind` until `shutdown` fires.
pub async fn run_server(state: AppState, bind: &str, shutdown: CancellationToken) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    info!(addr = bind, "Control server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(ServerError::Serve)
}
