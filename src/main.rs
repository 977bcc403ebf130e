use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use patchcore_service_rs::checkpoint::CheckpointResolver;
use patchcore_service_rs::config::ServerConfig;
use patchcore_service_rs::model::{CommandBackend, ModelCache};
use patchcore_service_rs::server::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let resolver = CheckpointResolver::from_env();
    let backend = Arc::new(CommandBackend::from_env());
    let cache = ModelCache::new(backend, resolver, config.device.clone());
    let state = Arc::new(AppState { cache });

    let app = router(state, config.body_limit_bytes);

    tracing::info!("listening on http://0.0.0.0:{}", config.port);
    axum::Server::bind(
        &format!("0.0.0.0:{}", config.port)
            .parse()
            .context("invalid listen address")?,
    )
    .serve(app.into_make_service())
    .await?;

    Ok(())
}
