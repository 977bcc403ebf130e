use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value};

use crate::error::ServiceError;
use crate::inference::{parse_sensitivity, run_inference};
use crate::model::ModelCache;
use crate::ui;

pub struct AppState {
    pub cache: ModelCache,
}

pub fn router(state: Arc<AppState>, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/infer", post(infer_handler))
        .route("/ui", get(ui::form_page).post(ui::submit_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .with_state(state)
        .route("/", get(index_handler))
}

async fn index_handler() -> &'static str {
    "PatchCore anomaly detection service.\n\
     POST /infer with multipart fields: file, sensitivity, feedback_json, ckpt_url.\n\
     Open /ui for the browser front end, GET /health for liveness.\n"
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let loaded = state
        .cache
        .loaded_checkpoint()
        .await
        .map(|path| path.display().to_string());
    Json(json!({
        "status": "ok",
        "device": state.cache.device(),
        "loaded_checkpoint_path": loaded,
    }))
}

/// Fields accepted by `POST /infer` and the UI form.
pub struct InferFields {
    pub file_bytes: Vec<u8>,
    pub filename: String,
    pub sensitivity: f32,
    pub feedback_text: String,
    pub ckpt_url: Option<String>,
}

pub async fn collect_fields(multipart: &mut Multipart) -> Result<InferFields, ServiceError> {
    let mut fields = InferFields {
        file_bytes: Vec::new(),
        filename: String::new(),
        sensitivity: 1.0,
        feedback_text: String::new(),
        ckpt_url: None,
    };

    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("file") => {
                fields.filename = field.file_name().unwrap_or("input.png").to_string();
                fields.file_bytes = field.bytes().await?.to_vec();
            }
            Some("sensitivity") => {
                fields.sensitivity = parse_sensitivity(&field.text().await?);
            }
            Some("feedback_json") => {
                fields.feedback_text = field.text().await?;
            }
            Some("ckpt_url") => {
                let url = field.text().await?;
                if !url.trim().is_empty() {
                    fields.ckpt_url = Some(url.trim().to_string());
                }
            }
            _ => {}
        }
    }

    Ok(fields)
}

async fn infer_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ServiceError> {
    let fields = collect_fields(&mut multipart).await?;
    if fields.file_bytes.is_empty() {
        return Err(ServiceError::EmptyUpload);
    }

    let started = Instant::now();
    let result = run_inference(
        &state.cache,
        &fields.file_bytes,
        &fields.filename,
        fields.sensitivity,
        &fields.feedback_text,
        fields.ckpt_url.as_deref(),
    )
    .await?;
    let duration_ms = started.elapsed().as_millis() as u64;

    tracing::info!(
        "inference done: label={} duration_ms={}",
        result.label.as_deref().unwrap_or("null"),
        duration_ms
    );

    Ok(Json(json!({
        "label": result.label,
        "json": result.report,
        "json_text": result.report_text,
        "boxed_image_base64": BASE64_STANDARD.encode(&result.boxed_bytes),
        "boxed_image_ext": result.boxed_image_ext,
        "feedback_applied": result.feedback_applied,
        "duration_ms": duration_ms,
    })))
}
