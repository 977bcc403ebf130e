use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failures a request can hit, grouped by who caused them: the deployment
/// (missing checkpoint configuration), the client (bad upload), or the
/// inference collaborator.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Model checkpoint not found. Provide CKPT_URL env or pass ckpt_url in the request.")]
    MissingCheckpointUrl,

    // reqwest re-exports http 1.x while axum 0.6 sits on http 0.2, so the
    // status is carried as a plain u16 instead of either StatusCode type.
    #[error("failed to download checkpoint from {url}: HTTP status {status}")]
    DownloadStatus { url: String, status: u16 },

    #[error("checkpoint download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("No file uploaded")]
    EmptyUpload,

    #[error("invalid multipart request: {0}")]
    Multipart(#[from] MultipartError),

    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("unsupported image input: {0}")]
    ImageInput(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::EmptyUpload
            | ServiceError::Multipart(_)
            | ServiceError::ImageInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
