//! REST adapter
//!
//! Thin mapping from the HTTP surface onto registry operations. Download
//! creation is accepted (202) before the transfer finishes; status queries
//! read the live handles; the only recognised update is cancellation.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::DownloadConfig;
use crate::engine::Download;
use crate::error::EngineError;
use crate::events::EventSink;
use crate::http::FetchClient;
use crate::metrics::Metrics;
use crate::model::Fragment;
use crate::registry::DownloadRegistry;
use crate::storage::StorageService;

/// Everything a handler needs to construct and drive downloads
pub struct ApiContext {
    pub registry: Arc<DownloadRegistry>,
    pub download: DownloadConfig,
    pub client: Arc<dyn FetchClient>,
    pub events: Arc<dyn EventSink>,
    pub storage: Arc<StorageService>,
    pub metrics: Arc<Metrics>,
}

pub fn router(ctx: Arc<ApiContext>) -> Router {
    Router::new()
        .route("/downloads", post(create_download).get(list_downloads))
        .route("/downloads/{id}", get(get_download).patch(update_download))
        .with_state(ctx)
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub uri: String,
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadUpdate {
    pub action: UpdateAction,
}

/// The only recognised update kind is cancellation
#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateAction {
    Cancel,
}

/// Wire shape of one download's status
#[derive(Debug, Serialize)]
pub struct DownloadStatus {
    pub id: String,
    pub uri: String,
    pub file: String,
    pub status: String,
    pub file_size: u64,
    /// Progress percentage; 0 while the total size is unknown
    pub progress: u64,
    pub elapsed_ms: u64,
    pub errors: Vec<String>,
    pub fragments: Vec<Fragment>,
}

impl DownloadStatus {
    fn from_download(download: &Download) -> Self {
        let resource = download.resource().snapshot();
        let (_, file_size, percent) = download.progress();
        Self {
            id: resource.id,
            uri: resource.uri,
            file: resource.file.display().to_string(),
            status: resource.status.to_string(),
            file_size,
            progress: percent,
            elapsed_ms: download.elapsed_ms(),
            errors: resource.errors,
            fragments: resource.fragments.into_values().collect(),
        }
    }
}

/// Error envelope carrying the HTTP status mapping
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation { .. } => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Busy { .. } => StatusCode::TOO_MANY_REQUESTS,
            EngineError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

/// Decode a request body, surfacing malformed payloads as 400 rather than
/// the framework's default 422
fn decode_body<T: serde::de::DeserializeOwned>(body: serde_json::Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| {
        ApiError(EngineError::Validation {
            field: "body",
            message: e.to_string(),
        })
    })
}

async fn create_download(
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<DownloadResponse>), ApiError> {
    let request: DownloadRequest = decode_body(body)?;

    let download = Arc::new(Download::new(
        &request.uri,
        &ctx.download,
        Arc::clone(&ctx.client),
        Arc::clone(&ctx.events),
        Arc::clone(&ctx.storage),
    ));
    let download = ctx.registry.admit(download)?;
    let id = download.start().await?;
    ctx.metrics.download_started();

    Ok((StatusCode::ACCEPTED, Json(DownloadResponse { id })))
}

async fn list_downloads(State(ctx): State<Arc<ApiContext>>) -> Json<Vec<DownloadStatus>> {
    let statuses = ctx
        .registry
        .list()
        .iter()
        .map(|d| DownloadStatus::from_download(d))
        .collect();
    Json(statuses)
}

async fn get_download(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<String>,
) -> Result<Json<DownloadStatus>, ApiError> {
    let download = ctx.registry.get(&id)?;
    Ok(Json(DownloadStatus::from_download(&download)))
}

async fn update_download(
    State(ctx): State<Arc<ApiContext>>,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<StatusCode, ApiError> {
    let update: DownloadUpdate = decode_body(body)?;
    let download = ctx.registry.get(&id)?;
    match update.action {
        UpdateAction::Cancel => download.cancel(),
    }
    Ok(StatusCode::ACCEPTED)
}
