use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, State},
    http::{header, Method},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::codec;
use crate::error::{ApiError, InferenceError};
use crate::inference::{Decision, InferenceService};

/// Shared, read-only state built before the server starts.
pub struct ServiceState {
    service: Option<InferenceService>,
}

impl ServiceState {
    pub fn new(service: Option<InferenceService>) -> Self {
        Self { service }
    }

    pub fn model_loaded(&self) -> bool {
        self.service.is_some()
    }
}

#[derive(Debug, Serialize)]
pub struct NsfwResponse {
    nsfw: bool,
    certainty: f64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    supported_formats: [&'static str; 1],
}

pub fn router(state: Arc<ServiceState>, body_limit_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/v1/image_nsfw", post(image_nsfw).fallback(not_found))
        .route("/health", get(health).fallback(not_found))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn image_nsfw(
    State(state): State<Arc<ServiceState>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<NsfwResponse>, ApiError> {
    // Covers the body size limit, which would otherwise answer in plain text.
    let body = body.map_err(|rejection| ApiError::UnreadableBody(rejection.to_string()))?;
    let payload = image_payload(&body)?;
    let service = state.service.clone();

    // Decoding and the forward pass are CPU bound.
    let decision = tokio::task::spawn_blocking(move || classify_payload(service, &payload))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(NsfwResponse {
        nsfw: decision.is_flagged,
        certainty: round4(decision.certainty),
    }))
}

async fn health(State(state): State<Arc<ServiceState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        model_loaded: state.model_loaded(),
        supported_formats: ["base64"],
    })
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

fn image_payload(body: &[u8]) -> Result<String, ApiError> {
    if body.is_empty() {
        return Err(ApiError::EmptyBody);
    }

    let value: Value = serde_json::from_slice(body).map_err(|_| ApiError::InvalidJson)?;
    let Value::Object(mut fields) = value else {
        return Err(ApiError::MissingImageData);
    };

    match fields.remove("image_data") {
        Some(Value::String(data)) => Ok(data),
        Some(_) => Err(ApiError::ImageDataNotString),
        None => Err(ApiError::MissingImageData),
    }
}

fn classify_payload(service: Option<InferenceService>, payload: &str) -> Result<Decision, ApiError> {
    let image = codec::decode(payload)?;
    let service = service.ok_or(InferenceError::ModelNotLoaded)?;
    Ok(service.infer(&image)?)
}

fn round4(value: f32) -> f64 {
    (f64::from(value) * 10_000.0).round() / 10_000.0
}
