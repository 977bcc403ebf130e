use std::env;

use anyhow::{Context, Result};

/// Server-side knobs, all sourced from the environment.
pub struct ServerConfig {
    pub port: u16,
    pub body_limit_bytes: usize,
    pub device: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "7860".into())
            .parse::<u16>()
            .context("PORT must be a valid number between 0 and 65535")?;

        let body_limit_bytes = {
            let mb = env::var("BODY_LIMIT_MB")
                .unwrap_or_else(|_| "25".into())
                .parse::<usize>()
                .context("BODY_LIMIT_MB must be a valid integer")?;
            mb * 1024 * 1024
        };

        let device = env::var("DEVICE").unwrap_or_else(|_| "cpu".into());

        Ok(Self {
            port,
            body_limit_bytes,
            device,
        })
    }
}
