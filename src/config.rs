//! Environment-driven configuration (spec §6.5). No config file, no CLI
//! framework — matches the plain `Config` structs this codebase's
//! standalone servers construct directly.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub target_host: String,
    pub target_path: String,
    pub segment_bytes: u64,
    pub cache_cap_bytes: u64,
    pub metadata_ttl: Duration,
    pub redirect_ttl: Duration,
    pub preload_ttl: Duration,
    pub cors_max_age_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8090,
            target_host: String::new(),
            target_path: "/webdav".to_string(),
            segment_bytes: 2 * 1024 * 1024,
            cache_cap_bytes: 500 * 1024 * 1024,
            metadata_ttl: Duration::from_secs(5 * 60),
            redirect_ttl: Duration::from_secs(10 * 60),
            preload_ttl: Duration::from_secs(2 * 60),
            cors_max_age_secs: 600,
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults
    /// for everything except `TARGET_HOST`, which must be set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        cfg.target_host = std::env::var("TARGET_HOST").map_err(|_| ConfigError::Missing("TARGET_HOST"))?;

        if let Ok(v) = std::env::var("PORT") {
            cfg.port = parse_env("PORT", &v)?;
        }
        if let Ok(v) = std::env::var("TARGET_PATH") {
            cfg.target_path = v;
        }
        if let Ok(v) = std::env::var("SEG") {
            cfg.segment_bytes = parse_env("SEG", &v)?;
        }
        if let Ok(v) = std::env::var("CAP") {
            cfg.cache_cap_bytes = parse_env("CAP", &v)?;
        }
        if let Ok(v) = std::env::var("METADATA_TTL_SECS") {
            cfg.metadata_ttl = Duration::from_secs(parse_env("METADATA_TTL_SECS", &v)?);
        }
        if let Ok(v) = std::env::var("REDIRECT_TTL_SECS") {
            cfg.redirect_ttl = Duration::from_secs(parse_env("REDIRECT_TTL_SECS", &v)?);
        }
        if let Ok(v) = std::env::var("PRELOAD_TTL_SECS") {
            cfg.preload_ttl = Duration::from_secs(parse_env("PRELOAD_TTL_SECS", &v)?);
        }
        if let Ok(v) = std::env::var("CORS_MAX_AGE_SECS") {
            cfg.cors_max_age_secs = parse_env("CORS_MAX_AGE_SECS", &v)?;
        }

        Ok(cfg)
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}
