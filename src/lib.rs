//! Bearer-token authentication gate for the boardstack bulletin-board
//! backend.
//!
//! - [`security`]: salted-digest credential records
//! - [`auth`]: HS256 token service and the SQLite user store
//! - [`gateway`]: axum router, the authentication filter and auth endpoints
//! - [`config`]: `config.toml` loading with environment overrides

pub mod auth;
pub mod config;
pub mod gateway;
pub mod security;
