// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use url::Url;

/// Load configuration from a file (YAML or JSON)
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .context("Failed to read config file")?;

    let config: Config = if path.extension().and_then(|s| s.to_str()) == Some("yaml")
        || path.extension().and_then(|s| s.to_str()) == Some("yml")
    {
        serde_yaml::from_str(&contents).context("Failed to parse YAML config")?
    } else {
        serde_json::from_str(&contents).context("Failed to parse JSON config")?
    };

    Ok(config)
}

/// Load the file if present, fall back to defaults otherwise, then layer
/// `LB_*` environment overrides on top and validate the result.
pub async fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let mut config = if tokio::fs::try_exists(path).await.unwrap_or(false) {
        load_config(path).await?
    } else {
        tracing::warn!(
            "Config file {} not found, using defaults",
            path.display()
        );
        Config::default()
    };

    let overrides = EnvOverrides::from_env()?;
    overrides.apply(&mut config)?;

    config.validate()?;
    Ok(config)
}

/// Settings that may be supplied through `LB_`-prefixed environment variables.
#[derive(Debug, Default, Deserialize)]
pub struct EnvOverrides {
    pub backend_urls: Option<String>,
    pub listen: Option<String>,
    pub health_check_interval_secs: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Result<Self> {
        ::config::Config::builder()
            .add_source(::config::Environment::with_prefix("LB"))
            .build()
            .context("Failed to read environment overrides")?
            .try_deserialize()
            .context("Failed to parse environment overrides")
    }

    pub fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(urls) = &self.backend_urls {
            config.backends = parse_backend_urls(urls)?;
        }

        if let Some(listen) = &self.listen {
            config.server.listen = listen
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid LB_LISTEN address '{}'", listen))?;
        }

        if let Some(interval) = &self.health_check_interval_secs {
            config.health_check.interval_secs = interval
                .trim()
                .parse()
                .with_context(|| format!("Invalid LB_HEALTH_CHECK_INTERVAL_SECS '{}'", interval))?;
        }

        Ok(())
    }
}

/// Parse a comma-separated list of backend URLs, skipping empty entries.
pub fn parse_backend_urls(raw: &str) -> Result<Vec<BackendConfig>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            Url::parse(s)
                .map(BackendConfig::new)
                .with_context(|| format!("Invalid backend URL '{}'", s))
        })
        .collect()
}
