use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::ServiceError;

pub const DEFAULT_CKPT_PATH: &str = "./model_weights/model.ckpt";

const DOWNLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Resolves the on-disk checkpoint, downloading it on first use.
pub struct CheckpointResolver {
    target: PathBuf,
    default_url: Option<String>,
}

impl CheckpointResolver {
    pub fn new(target: PathBuf, default_url: Option<String>) -> Self {
        Self {
            target,
            default_url,
        }
    }

    pub fn from_env() -> Self {
        let target = env::var("CKPT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CKPT_PATH));
        Self::new(target, env::var("CKPT_URL").ok())
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Returns the checkpoint path, fetching it if the file is missing.
    /// URL precedence: per-request override, then the configured default.
    /// Neither is a configuration error, reported before any network use.
    pub async fn ensure(&self, override_url: Option<&str>) -> Result<PathBuf, ServiceError> {
        if self.target.is_file() {
            return Ok(self.target.clone());
        }

        let url = override_url
            .map(str::to_owned)
            .or_else(|| self.default_url.clone())
            .ok_or(ServiceError::MissingCheckpointUrl)?;

        download_checkpoint(&url, &self.target).await?;
        Ok(self.target.clone())
    }
}

/// Streams the remote checkpoint to disk chunk by chunk so large weights
/// files never sit fully in memory.
async fn download_checkpoint(url: &str, target: &Path) -> Result<(), ServiceError> {
    tracing::info!("downloading checkpoint {} -> {}", url, target.display());

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }

    let client = reqwest::Client::builder()
        .connect_timeout(DOWNLOAD_CONNECT_TIMEOUT)
        .build()?;
    let mut response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(ServiceError::DownloadStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    // Stream into a sibling partial file first so an interrupted download
    // never leaves a truncated checkpoint at the target path.
    let partial = target.with_extension("partial");
    let mut file = fs::File::create(&partial).await?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);
    fs::rename(&partial, target).await?;

    tracing::info!("checkpoint saved to {}", target.display());
    Ok(())
}
