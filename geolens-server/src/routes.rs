//! HTTP API routes.

use crate::collab::mapillary::MapillaryClient;
use crate::error::ServerError;
use crate::pipeline::StageContext;
use crate::upload::ImageFormat;
use crate::ws::ws_handler;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    pub ctx: StageContext,
    pub street_view: Option<Arc<MapillaryClient>>,
    pub max_upload_bytes: usize,
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    let upload_limit = state.max_upload_bytes + 1024 * 1024;
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Image upload (session creation)
        .route("/upload-image", post(upload_image))
        // Session streaming connection
        .route("/ws/:session_id", get(ws_handler))
        // Reference imagery lookup
        .route("/street-view", get(street_view))
        .layer(DefaultBodyLimit::max(upload_limit))
        .with_state(state)
}

// ============ Health Check ============

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "geolens-server",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ============ Image Upload ============

#[derive(Debug, Deserialize)]
struct UploadQuery {
    /// Attach the upload to an existing session (upload after connect).
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    session_id: String,
    filename: String,
    size: usize,
    format: &'static str,
}

async fn upload_image(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ServerError> {
    let mut file: Option<(String, Vec<u8>, Option<String>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::InvalidRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().map(String::from);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ServerError::InvalidRequest(e.to_string()))?;
        file = Some((filename, bytes.to_vec(), content_type));
        break;
    }

    let (filename, bytes, content_type) =
        file.ok_or_else(|| ServerError::InvalidRequest("missing file field".into()))?;
    let format = validate_upload(&bytes, content_type.as_deref(), state.max_upload_bytes)?;

    let handle = state
        .ctx
        .uploads
        .put(&bytes, format)
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?;

    let session_id = bind_session(&state.ctx, query.session_id, handle).await?;

    tracing::info!(session_id, filename, size = bytes.len(), "Image uploaded");

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "success": true,
            "data": UploadResponse {
                session_id,
                filename,
                size: bytes.len(),
                format: format.mime(),
            }
        })),
    ))
}

/// Attach the upload to its session: an explicit session id must already
/// exist (upload after connect); otherwise a fresh session is created.
async fn bind_session(
    ctx: &StageContext,
    session_id: Option<String>,
    handle: crate::upload::UploadHandle,
) -> Result<String, ServerError> {
    match session_id {
        Some(id) => {
            if !ctx.sessions.contains(&id).await {
                return Err(ServerError::SessionNotFound(id));
            }
            ctx.sessions.set_upload(&id, handle).await;
            Ok(id)
        }
        None => Ok(ctx.sessions.create_with_upload(handle).await),
    }
}

/// Validate an upload: declared type, size limit, and sniffed format.
fn validate_upload(
    bytes: &[u8],
    content_type: Option<&str>,
    max_bytes: usize,
) -> Result<ImageFormat, ServerError> {
    if let Some(content_type) = content_type {
        if !content_type.starts_with("image/") {
            return Err(ServerError::NotAnImage);
        }
    }
    if bytes.len() > max_bytes {
        return Err(ServerError::FileTooLarge);
    }
    ImageFormat::sniff(bytes)
        .ok_or_else(|| ServerError::InvalidImage("unrecognized image format".into()))
}

// ============ Street View ============

#[derive(Debug, Deserialize)]
struct StreetViewQuery {
    lat: f64,
    lon: f64,
    #[serde(default = "default_street_view_limit")]
    limit: usize,
}

fn default_street_view_limit() -> usize {
    5
}

async fn street_view(
    State(state): State<AppState>,
    Query(query): Query<StreetViewQuery>,
) -> Result<impl IntoResponse, ServerError> {
    let client = state
        .street_view
        .as_ref()
        .ok_or_else(|| ServerError::StreetViewUnavailable("not configured".into()))?;

    let images = client
        .nearby_images(query.lat, query.lon, query.limit)
        .await
        .map_err(|e| ServerError::StreetViewUnavailable(e.to_string()))?;

    Ok(Json(serde_json::json!({
        "success": true,
        "data": { "images": images }
    })))
}
