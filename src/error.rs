use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Bad upload: missing field, disallowed type, oversized or empty file.
    #[error("{0}")]
    Validation(String),
    #[error("image classification failed")]
    Classification(#[source] anyhow::Error),
    #[error("caption generation failed")]
    Generation(#[source] anyhow::Error),
    #[error("unexpected error")]
    Unhandled(#[source] anyhow::Error),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable identifier handed to clients in place of internal detail.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::Classification(_) => "classification_failed",
            Self::Generation(_) => "generation_failed",
            Self::Unhandled(_) => "internal_error",
        }
    }

    fn chain(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            Self::Classification(e) | Self::Generation(e) | Self::Unhandled(e) => {
                format!("{}: {:#}", self, e)
            }
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for AppError {
    fn from(e: axum::extract::multipart::MultipartError) -> Self {
        Self::Unhandled(anyhow::anyhow!("malformed multipart body: {e}"))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

/// An [`AppError`] paired with whether internal detail may reach the client.
#[derive(Debug)]
pub struct ApiError {
    pub error: AppError,
    pub expose_details: bool,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let body = match &self.error {
            AppError::Validation(message) => {
                tracing::warn!("upload rejected: {}", message);
                ErrorBody {
                    error: message.clone(),
                    details: None,
                }
            }
            other => {
                let chain = other.chain();
                tracing::error!(code = other.code(), "request failed: {}", chain);
                let error = match other {
                    AppError::Unhandled(_) => "Something went wrong!",
                    _ => "Error processing image",
                };
                ErrorBody {
                    error: error.to_string(),
                    details: Some(if self.expose_details {
                        chain
                    } else {
                        other.code().to_string()
                    }),
                }
            }
        };
        (status, Json(body)).into_response()
    }
}
