use std::fs;
use std::path::Path;

use serde_json::{json, Value};

use crate::error::ServiceError;
use crate::model::{ModelCache, PipelineRequest, DEFAULT_INFER_SIZE};

const SENSITIVITY_MIN: f32 = 0.1;
const SENSITIVITY_MAX: f32 = 2.0;
const DEFAULT_SENSITIVITY: f32 = 1.0;

/// Everything a transport needs to answer a request: the label, the
/// annotated image bytes, and the detection report in both forms.
#[derive(Debug)]
pub struct InferenceResult {
    pub label: Option<String>,
    pub boxed_bytes: Vec<u8>,
    pub boxed_image_ext: String,
    pub report: Value,
    pub report_text: String,
    pub feedback_applied: bool,
}

pub fn clamp_sensitivity(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(SENSITIVITY_MIN, SENSITIVITY_MAX)
    } else {
        DEFAULT_SENSITIVITY
    }
}

/// Form fields arrive as text; anything unparsable falls back to 1.0.
pub fn parse_sensitivity(raw: &str) -> f32 {
    match raw.trim().parse::<f32>() {
        Ok(value) => clamp_sensitivity(value),
        Err(_) => DEFAULT_SENSITIVITY,
    }
}

/// Malformed feedback is a soft failure: the request still runs with
/// default behavior and the parse error travels along as a marker object.
pub fn parse_feedback(text: &str) -> Value {
    if text.trim().is_empty() {
        return json!({});
    }
    match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => json!({ "error": format!("Failed to parse feedback: {err}") }),
    }
}

/// Shared inference routine behind both the REST endpoint and the UI.
///
/// Stages the upload into a scratch workspace, runs the collaborator under
/// the model lock, and reads its two artifacts back into memory. The
/// workspace is removed on every exit path, including errors.
pub async fn run_inference(
    cache: &ModelCache,
    image_bytes: &[u8],
    filename: &str,
    sensitivity: f32,
    feedback_text: &str,
    ckpt_override: Option<&str>,
) -> Result<InferenceResult, ServiceError> {
    let sensitivity = clamp_sensitivity(sensitivity);
    let session = cache.session(ckpt_override).await?;

    // TempDir cleans up on drop, which covers the error returns below.
    let workspace = tempfile::Builder::new()
        .prefix("patchcore_api_")
        .tempdir()?;

    // Only the final path component of the client filename is trusted.
    let input_name = Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("input.png");
    let input_path = workspace.path().join(input_name);
    fs::write(&input_path, image_bytes)?;

    let out_base = workspace.path().join("outputs");
    let boxed_dir = out_base.join("boxed");
    let mask_dir = out_base.join("masks");
    let filtered_dir = out_base.join("filtered");
    for dir in [&boxed_dir, &mask_dir, &filtered_dir] {
        fs::create_dir_all(dir)?;
    }

    let feedback = parse_feedback(feedback_text);
    let outcome = session.run(&PipelineRequest {
        ckpt_path: session.checkpoint(),
        input_path: &input_path,
        boxed_dir: &boxed_dir,
        mask_dir: &mask_dir,
        filtered_dir: &filtered_dir,
        infer_size: DEFAULT_INFER_SIZE,
        sensitivity,
        feedback: &feedback,
    })?;

    let boxed_bytes = fs::read(&outcome.boxed_path)?;
    let report_text = fs::read_to_string(&outcome.json_path)?;
    let report: Value = serde_json::from_str(&report_text)?;
    let boxed_image_ext = outcome
        .boxed_path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_else(|| ".png".to_string());

    Ok(InferenceResult {
        label: outcome.label,
        boxed_bytes,
        boxed_image_ext,
        report,
        report_text,
        feedback_applied: outcome.feedback_applied,
    })
}
