use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

use crate::checkpoint::CheckpointResolver;
use crate::error::ServiceError;

/// Side length the collaborator resizes inputs to before scoring.
pub const DEFAULT_INFER_SIZE: u32 = 256;

const DEFAULT_INFER_PROGRAM: &str = "patchcore-infer";

/// One staged inference call: the input image plus the directories the
/// collaborator writes its artifacts into.
pub struct PipelineRequest<'a> {
    pub ckpt_path: &'a Path,
    pub input_path: &'a Path,
    pub boxed_dir: &'a Path,
    pub mask_dir: &'a Path,
    pub filtered_dir: &'a Path,
    pub infer_size: u32,
    pub sensitivity: f32,
    pub feedback: &'a Value,
}

/// What the collaborator reports back: where it wrote the boxed image and
/// the JSON detections, plus the predicted label when it assigned one.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub label: Option<String>,
    pub boxed_path: PathBuf,
    pub json_path: PathBuf,
    pub feedback_applied: bool,
}

/// Seam for the opaque PatchCore pipeline. The production backend shells
/// out to the external collaborator; tests substitute a mock.
pub trait InferenceBackend: Send + Sync {
    /// Load (or reload) the model for the given checkpoint. Only called
    /// under the cache lock.
    fn load(&self, ckpt_path: &Path, device: &str) -> Result<(), ServiceError>;

    /// Run detection for one staged input image.
    fn run(&self, request: &PipelineRequest<'_>) -> Result<PipelineOutcome, ServiceError>;
}

/// Invokes the external PatchCore collaborator as a subprocess. The
/// command prints a result object on stdout naming the artifact paths.
pub struct CommandBackend {
    program: String,
    base_args: Vec<String>,
}

impl CommandBackend {
    pub fn from_env() -> Self {
        let raw = env::var("INFER_CMD").unwrap_or_default();
        let mut parts = raw.split_whitespace().map(str::to_owned);
        let program = parts.next().unwrap_or_else(|| DEFAULT_INFER_PROGRAM.into());
        Self {
            program,
            base_args: parts.collect(),
        }
    }
}

impl InferenceBackend for CommandBackend {
    fn load(&self, ckpt_path: &Path, device: &str) -> Result<(), ServiceError> {
        // The subprocess receives the checkpoint on every run; loading here
        // only verifies the weights file is actually readable.
        if !ckpt_path.is_file() {
            return Err(ServiceError::ModelLoad(format!(
                "checkpoint is not a readable file: {}",
                ckpt_path.display()
            )));
        }
        tracing::info!("model ready on {}: {}", device, ckpt_path.display());
        Ok(())
    }

    fn run(&self, request: &PipelineRequest<'_>) -> Result<PipelineOutcome, ServiceError> {
        let output = Command::new(&self.program)
            .args(&self.base_args)
            .arg("--ckpt")
            .arg(request.ckpt_path)
            .arg("--input")
            .arg(request.input_path)
            .arg("--out-boxed-dir")
            .arg(request.boxed_dir)
            .arg("--out-mask-dir")
            .arg(request.mask_dir)
            .arg("--out-filtered-dir")
            .arg(request.filtered_dir)
            .arg("--infer-size")
            .arg(request.infer_size.to_string())
            .arg("--sensitivity")
            .arg(request.sensitivity.to_string())
            .arg("--feedback-json")
            .arg(request.feedback.to_string())
            .output()
            .map_err(|err| {
                ServiceError::Inference(format!("failed to spawn {}: {err}", self.program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServiceError::Inference(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let value: Value = serde_json::from_slice(&output.stdout).map_err(|err| {
            ServiceError::Inference(format!("collaborator produced invalid JSON: {err}"))
        })?;
        parse_outcome(&value)
    }
}

fn parse_outcome(value: &Value) -> Result<PipelineOutcome, ServiceError> {
    let path_field = |key: &str| -> Result<PathBuf, ServiceError> {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| {
                ServiceError::Inference(format!("collaborator result is missing '{key}'"))
            })
    };

    Ok(PipelineOutcome {
        label: value
            .get("label")
            .and_then(Value::as_str)
            .map(str::to_string),
        boxed_path: path_field("boxed_path")?,
        json_path: path_field("json_path")?,
        feedback_applied: value
            .get("feedback")
            .and_then(|f| f.get("applied"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

struct CacheState {
    loaded_ckpt: Option<PathBuf>,
}

/// At most one loaded model per process. The single mutex serializes
/// loads, reloads, and every inference call against the loaded model; the
/// collaborator is not assumed safe for concurrent use.
pub struct ModelCache {
    backend: Arc<dyn InferenceBackend>,
    resolver: CheckpointResolver,
    device: String,
    state: Mutex<CacheState>,
}

impl ModelCache {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        resolver: CheckpointResolver,
        device: String,
    ) -> Self {
        Self {
            backend,
            resolver,
            device,
            state: Mutex::new(CacheState { loaded_ckpt: None }),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub async fn loaded_checkpoint(&self) -> Option<PathBuf> {
        self.state.lock().await.loaded_ckpt.clone()
    }

    /// Acquires the model lock and makes sure a model for the resolved
    /// checkpoint is loaded. A reload happens only when the resolved path
    /// differs from the one already loaded. The returned session keeps the
    /// lock held, so inference through it stays serialized.
    pub async fn session(
        &self,
        override_url: Option<&str>,
    ) -> Result<ModelSession<'_>, ServiceError> {
        let mut state = self.state.lock().await;
        let ckpt = self.resolver.ensure(override_url).await?;

        if state.loaded_ckpt.as_deref() != Some(ckpt.as_path()) {
            self.backend.load(&ckpt, &self.device)?;
            state.loaded_ckpt = Some(ckpt.clone());
        }

        Ok(ModelSession {
            _guard: state,
            ckpt,
            backend: Arc::clone(&self.backend),
        })
    }
}

/// Exclusive access to the loaded model for the duration of one request.
pub struct ModelSession<'a> {
    _guard: MutexGuard<'a, CacheState>,
    ckpt: PathBuf,
    backend: Arc<dyn InferenceBackend>,
}

impl ModelSession<'_> {
    pub fn checkpoint(&self) -> &Path {
        &self.ckpt
    }

    pub fn run(&self, request: &PipelineRequest<'_>) -> Result<PipelineOutcome, ServiceError> {
        self.backend.run(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outcome_parsing_reads_paths_and_flag() {
        let value = json!({
            "label": "anomaly",
            "boxed_path": "/tmp/out/boxed/img_boxed.png",
            "json_path": "/tmp/out/img.json",
            "feedback": { "applied": true }
        });

        let outcome = parse_outcome(&value).unwrap();
        assert_eq!(outcome.label.as_deref(), Some("anomaly"));
        assert_eq!(
            outcome.boxed_path,
            PathBuf::from("/tmp/out/boxed/img_boxed.png")
        );
        assert!(outcome.feedback_applied);
    }

    #[test]
    fn outcome_without_label_propagates_none() {
        let value = json!({
            "boxed_path": "a.png",
            "json_path": "a.json"
        });

        // An absent label must travel as null, not a placeholder string.
        let outcome = parse_outcome(&value).unwrap();
        assert_eq!(outcome.label, None);
        assert!(!outcome.feedback_applied);
    }

    #[test]
    fn outcome_parsing_rejects_missing_artifacts() {
        let err = parse_outcome(&json!({ "label": "ok" })).unwrap_err();
        assert!(matches!(err, ServiceError::Inference(_)));
    }
}
