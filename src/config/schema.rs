//! Configuration schema for `config.toml`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,

    /// Path the configuration was loaded from. Not serialized.
    #[serde(skip)]
    pub config_path: PathBuf,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            request_timeout_secs: 30,
            max_body_bytes: 65_536,
        }
    }
}

/// Token signing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// HMAC secret for HS256 signatures. Must be non-empty to serve.
    pub secret: String,
    /// Access token lifetime in seconds (24h).
    pub access_ttl_secs: u64,
    /// Refresh token lifetime in seconds (7 days).
    pub refresh_ttl_secs: u64,
    /// Clock-skew tolerance applied to `exp`.
    pub leeway_secs: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            access_ttl_secs: 86_400,
            refresh_ttl_secs: 7 * 86_400,
            leeway_secs: 0,
        }
    }
}

/// Route classification and account policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Public routes. Entries ending in `*` are prefixes, the rest are exact
    /// paths. Empty means the built-in table.
    pub public_routes: Vec<String>,
    /// Also expose `/api/boards/`, `/api/openstack/` and `/api/integrated/`
    /// without authentication, as the legacy deployment did.
    pub legacy_public_prefixes: bool,
    pub allow_registration: bool,
    pub min_password_len: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            public_routes: Vec::new(),
            legacy_public_prefixes: false,
            allow_registration: true,
            min_password_len: 6,
        }
    }
}

/// User store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// Create the `admin` and `user` accounts when the store is empty.
    pub seed_default_users: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("boardstack.db"),
            seed_default_users: true,
        }
    }
}

/// Logging configuration. `RUST_LOG` takes precedence when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}
