//! Configuration loading.
//!
//! Resolution order: built-in defaults, then `config.toml`, then
//! `BOARDSTACK_*` environment variables.

pub mod schema;

pub use schema::{AuthConfig, Config, DatabaseConfig, JwtConfig, LoggingConfig, ServerConfig};

use crate::auth::token::MAX_LEEWAY_SECS;
use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const ENV_HOST: &str = "BOARDSTACK_HOST";
pub const ENV_PORT: &str = "BOARDSTACK_PORT";
pub const ENV_JWT_SECRET: &str = "BOARDSTACK_JWT_SECRET";

impl Config {
    /// Load configuration from `path`, or from the default location when
    /// `path` is `None`. A missing default file yields built-in defaults; a
    /// missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (config_path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (default_config_path(), false),
        };

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config {}", config_path.display()))?;
            Self::from_toml(&contents)?
        } else if explicit {
            bail!("Config file {} does not exist", config_path.display());
        } else {
            tracing::debug!(path = %config_path.display(), "No config file, using defaults");
            Self::default()
        };

        config.config_path = config_path;
        config.apply_env_overrides_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| anyhow::anyhow!("Failed to parse config: {e}"))
    }

    /// Apply `BOARDSTACK_*` overrides using the given variable lookup.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_HOST).filter(|h| !h.trim().is_empty()) {
            self.server.host = host.trim().to_string();
        }
        if let Some(port) = lookup(ENV_PORT) {
            match port.trim().parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid {ENV_PORT}"),
            }
        }
        if let Some(secret) = lookup(ENV_JWT_SECRET).filter(|s| !s.is_empty()) {
            self.jwt.secret = secret;
        }
    }

    /// Reject configurations the gateway cannot serve with.
    pub fn validate(&self) -> Result<()> {
        if self.jwt.secret.trim().is_empty() {
            bail!("jwt.secret is empty; set it in config.toml or via {ENV_JWT_SECRET}");
        }
        if self.jwt.access_ttl_secs == 0 || self.jwt.refresh_ttl_secs == 0 {
            bail!("jwt token lifetimes must be positive");
        }
        if self.jwt.leeway_secs > MAX_LEEWAY_SECS {
            bail!("jwt.leeway_secs must be at most {MAX_LEEWAY_SECS}");
        }
        if self.jwt.leeway_secs >= self.jwt.access_ttl_secs {
            bail!("jwt.leeway_secs must be shorter than jwt.access_ttl_secs");
        }
        if self.auth.min_password_len == 0 {
            bail!("auth.min_password_len must be at least 1");
        }
        Ok(())
    }
}

/// `<platform config dir>/boardstack/config.toml`, or `./config.toml` when
/// no home directory can be resolved.
pub fn default_config_path() -> PathBuf {
    ProjectDirs::from("", "", "boardstack")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}
