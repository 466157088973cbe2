use std::{path::Path, sync::Arc};

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::{
    error::{ApiError, AppError},
    pipeline::CaptionPipeline,
    upload::{self, UploadPolicy},
};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<CaptionPipeline>,
    pub upload: UploadPolicy,
    /// Whether 5xx bodies carry the internal error chain.
    pub expose_error_details: bool,
}

impl AppState {
    fn api_error(&self, error: AppError) -> ApiError {
        ApiError {
            error,
            expose_details: self.expose_error_details,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub message: String,
    pub filename: String,
    pub image_description: String,
    pub captions: Vec<String>,
}

pub fn router(state: AppState, public_dir: impl AsRef<Path>) -> Router {
    Router::new()
        .route("/test", get(test))
        .route("/upload", post(upload_image))
        .fallback_service(ServeDir::new(public_dir.as_ref()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                // the upload receiver enforces its own cap while streaming
                .layer(DefaultBodyLimit::disable()),
        )
        .with_state(state)
}

async fn test() -> Json<Value> {
    Json(json!({ "message": "Server is working" }))
}

async fn upload_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    // a body that isn't multipart at all carries no file
    let multipart = multipart.map_err(|rejection| {
        tracing::debug!("not a multipart request: {}", rejection);
        state.api_error(AppError::validation(upload::MSG_NO_FILE))
    })?;

    let stored = upload::receive(multipart, &state.upload)
        .await
        .map_err(|e| state.api_error(e))?;

    tracing::info!(
        "processing {} ({} bytes, {}) stored as {}",
        stored.original_name,
        stored.size,
        stored.content_type.as_deref().unwrap_or("no content type"),
        stored.filename
    );

    let result = state
        .pipeline
        .process(&stored.path)
        .await
        .map_err(|e| state.api_error(e))?;

    Ok(Json(UploadResponse {
        message: "File uploaded successfully".to_string(),
        filename: stored.filename.clone(),
        image_description: result.description,
        captions: result.captions,
    }))
}
