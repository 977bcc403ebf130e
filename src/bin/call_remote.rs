//! Helper to call the inference endpoint locally or on the hosted Space.
//!
//! Example (remote):
//!   call-remote --image test_image/test01.jpg --save-dir outputs_remote
//!
//! Example (local):
//!   call-remote --image test_image/test01.jpg \
//!     --url http://localhost:7860/infer --save-dir outputs_local

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use clap::Parser;
use reqwest::multipart;
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_URL: &str = "https://lasidu-automatic-anamoly-detection.hf.space/infer";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// Call the PatchCore inference endpoint.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the image to send
    #[arg(long)]
    image: PathBuf,

    /// Endpoint URL (Space or local server); defaults to HF_SPACE_URL env
    #[arg(long)]
    url: Option<String>,

    /// Detection sensitivity (0.1 - 2.0)
    #[arg(long, default_value_t = 1.0)]
    sensitivity: f32,

    /// Path to a JSON feedback file to include (optional)
    #[arg(long)]
    feedback: Option<PathBuf>,

    /// Optional checkpoint URL if the server should download weights
    #[arg(long)]
    ckpt_url: Option<String>,

    /// Directory to save boxed image + JSON locally
    #[arg(long)]
    save_dir: Option<PathBuf>,
}

#[derive(Deserialize)]
struct InferResponse {
    label: Option<String>,
    json: Option<Value>,
    boxed_image_base64: String,
    boxed_image_ext: Option<String>,
    feedback_applied: Option<bool>,
    duration_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if !args.image.exists() {
        bail!("Image not found: {}", args.image.display());
    }

    let url = args
        .url
        .clone()
        .or_else(|| env::var("HF_SPACE_URL").ok())
        .unwrap_or_else(|| DEFAULT_URL.to_string());

    let feedback_text = match &args.feedback {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Feedback file not found: {}", path.display()))?,
        None => String::new(),
    };

    let file_name = args
        .image
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input.png".to_string());
    let file_part = multipart::Part::bytes(fs::read(&args.image)?)
        .file_name(file_name)
        .mime_str("application/octet-stream")?;

    let mut form = multipart::Form::new()
        .part("file", file_part)
        .text("sensitivity", args.sensitivity.to_string())
        .text("feedback_json", feedback_text);
    if let Some(ckpt_url) = &args.ckpt_url {
        form = form.text("ckpt_url", ckpt_url.clone());
    }

    println!("[call] POST {url}");
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()?;
    let response = client
        .post(&url)
        .multipart(form)
        .send()
        .await?
        .error_for_status()?;
    let result: InferResponse = response.json().await?;

    println!("[label] {}", result.label.as_deref().unwrap_or("unknown"));
    println!(
        "[feedback_applied] {}",
        result.feedback_applied.unwrap_or(false)
    );
    if let Some(duration_ms) = result.duration_ms {
        println!("[duration_ms] {duration_ms}");
    }

    if let Some(save_dir) = &args.save_dir {
        save_outputs(&result, &args.image, save_dir)?;
    }

    Ok(())
}

/// Writes `<stem>_boxed<ext>` and `<stem>.json` under the save directory.
fn save_outputs(result: &InferResponse, image_path: &Path, save_dir: &Path) -> Result<()> {
    fs::create_dir_all(save_dir)?;
    let stem = image_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());

    let boxed_bytes = BASE64_STANDARD
        .decode(&result.boxed_image_base64)
        .context("response contained invalid base64 image data")?;
    let ext = result.boxed_image_ext.as_deref().unwrap_or(".png");
    let boxed_path = save_dir.join(format!("{stem}_boxed{ext}"));
    fs::write(&boxed_path, boxed_bytes)?;

    let report = result.json.clone().unwrap_or_else(|| Value::Object(Default::default()));
    let json_path = save_dir.join(format!("{stem}.json"));
    fs::write(&json_path, serde_json::to_string_pretty(&report)?)?;

    println!("[saved] {}", boxed_path.display());
    println!("[saved] {}", json_path.display());
    Ok(())
}
