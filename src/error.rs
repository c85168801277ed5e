use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures turning an `image_data` payload into pixels.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid base64 encoding")]
    InvalidEncoding(#[from] base64::DecodeError),
    #[error("Invalid image data: {0}")]
    InvalidImage(#[from] image::ImageError),
}

/// Failures loading or running the model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TensorFlow error: {0}")]
    Tensorflow(String),
    #[error("operation '{0}' not found in graph")]
    MissingOperation(&'static str),
    #[error("invalid preprocessor config: {0}")]
    Config(#[from] serde_json::Error),
    #[error("class list is empty")]
    NoLabels,
    #[error("model returned {got} scores for {expected} labels")]
    OutputMismatch { expected: usize, got: usize },
    #[error("download failed: {0}")]
    Download(String),
}

impl From<tensorflow::Status> for ModelError {
    fn from(status: tensorflow::Status) -> Self {
        ModelError::Tensorflow(status.to_string())
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        ModelError::Download(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Error processing image: {0}")]
    Failure(String),
    #[error("model is not loaded")]
    ModelNotLoaded,
}

/// Fatal errors raised before the server starts accepting requests.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to fetch model artifacts: {0}")]
    Fetch(ModelError),
    #[error("failed to load model: {0}")]
    Load(ModelError),
    #[error("server error: {0}")]
    Server(String),
}

/// Everything a request can fail with. Each variant maps to one status code
/// and is rendered as `{"error": "<message>"}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No request body provided")]
    EmptyBody,
    #[error("Failed to read request body: {0}")]
    UnreadableBody(String),
    #[error("Invalid JSON in request body")]
    InvalidJson,
    #[error("Missing \"image_data\" in request body. Expected base64 encoded image.")]
    MissingImageData,
    #[error("\"image_data\" must be a base64 encoded string")]
    ImageDataNotString,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Internal server error: {0}")]
    Inference(#[from] InferenceError),
    #[error("Internal server error: {0}")]
    Internal(String),
    #[error("Endpoint not found")]
    NotFound,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::EmptyBody
            | ApiError::UnreadableBody(_)
            | ApiError::InvalidJson
            | ApiError::MissingImageData
            | ApiError::ImageDataNotString
            | ApiError::Decode(_) => StatusCode::BAD_REQUEST,
            ApiError::Inference(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(%status, "{}", message);
        } else if status != StatusCode::NOT_FOUND {
            tracing::warn!(%status, "{}", message);
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}
