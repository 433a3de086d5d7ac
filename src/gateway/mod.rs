//! Axum-based HTTP gateway.
//!
//! Every route sits behind the bearer-token [`AuthLayer`]; the route table
//! decides which paths skip the token check. The gateway also applies:
//! - Request body size limits (`server.max_body_bytes`, 64KB default)
//! - Request timeouts (`server.request_timeout_secs`, 30s default) against
//!   slow-loris clients

pub mod filter;

pub use filter::{
    apply_cors_headers, unauthorized_response, Access, AuthFailure, AuthGate, AuthLayer,
    AuthService, RequestIdentity, RoutePattern, RouteTable,
};

use crate::auth::{StoreError, TokenService, User, UserLookup, UserStore};
use crate::config::{Config, ServerConfig};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post, put},
    Extension, Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Value of `tokenType` in token responses.
pub const TOKEN_TYPE: &str = "Bearer";

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub tokens: Arc<TokenService>,
    pub users: Arc<UserStore>,
    pub allow_registration: bool,
    pub min_password_len: usize,
}

impl AppState {
    pub fn from_config(config: &Config, users: Arc<UserStore>) -> Self {
        Self {
            tokens: Arc::new(TokenService::from_config(&config.jwt)),
            users,
            allow_registration: config.auth.allow_registration,
            min_password_len: config.auth.min_password_len,
        }
    }

    /// The filter shares this state's token service and user store.
    pub fn auth_gate(&self, routes: RouteTable) -> AuthGate {
        let lookup: Arc<dyn UserLookup> = self.users.clone();
        AuthGate::new(self.tokens.clone(), lookup, routes)
    }
}

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(serde_json::json!({"error": message.into()})))
}

fn internal_error(context: &str, err: impl std::fmt::Display) -> ApiResponse {
    tracing::error!(error = %err, "{context}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, context)
}

/// Run the HTTP gateway until Ctrl+C or SIGTERM.
pub async fn run_gateway(config: Config) -> Result<()> {
    config.validate()?;

    let store = UserStore::open(&config.database.path).with_context(|| {
        format!(
            "Failed to open user store at {}",
            config.database.path.display()
        )
    })?;
    if config.database.seed_default_users && store.seed_defaults()? {
        tracing::warn!("Seeded default accounts admin/user; change their passwords");
    }

    let state = AppState::from_config(&config, Arc::new(store));
    let routes = RouteTable::from_config(&config.auth);
    tracing::info!(public_routes = routes.len(), "Route table built");
    let gate = state.auth_gate(routes);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let actual_port = listener.local_addr()?.port();
    tracing::info!(host = %config.server.host, port = actual_port, "Gateway listening");

    let app = build_router(state, gate, &config.server);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Gateway stopped");
    Ok(())
}

/// Assemble the router: handlers, body limit, timeout and the auth filter.
pub fn build_router(state: AppState, gate: AuthGate, server: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/api/health/status", get(handle_health))
        .route("/api/auth/login", post(handle_login))
        .route("/api/auth/refresh", post(handle_refresh))
        .route("/api/auth/me", get(handle_me))
        .route("/api/auth/register", post(handle_register))
        .route("/api/users/me/password", put(handle_change_password))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(server.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(server.request_timeout_secs),
        ))
        // Outermost, so 408 and 413 responses also carry CORS headers.
        .layer(AuthLayer::new(gate))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

/// Bearer token from the `Authorization` header, if well-formed.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(TokenService::extract_token_from_header)
}

// ══════════════════════════════════════════════════════════════════════════════
// Service endpoints
// ══════════════════════════════════════════════════════════════════════════════

/// GET /: service banner.
async fn handle_root() -> ApiResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "service": env!("CARGO_PKG_NAME"),
            "status": "running",
        })),
    )
}

/// GET /api/health/status: liveness probe.
async fn handle_health() -> ApiResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "UP",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

// ══════════════════════════════════════════════════════════════════════════════
// Auth endpoints
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub username: String,
    pub password: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordBody {
    pub old_password: String,
    pub new_password: String,
}

/// Token response shared by login and refresh.
fn token_response(
    state: &AppState,
    user: &User,
    roles: &[String],
    access_token: &str,
    refresh_token: &str,
) -> ApiResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "accessToken": access_token,
            "refreshToken": refresh_token,
            "tokenType": TOKEN_TYPE,
            "expiresIn": state.tokens.access_ttl_millis(),
            "username": user.username,
            "name": user.name,
            "email": user.email,
            "roles": roles,
            "issuedAt": Utc::now().timestamp_millis(),
        })),
    )
}

/// POST /api/auth/login: check credentials and issue a token pair.
async fn handle_login(
    State(state): State<AppState>,
    body: Result<Json<LoginBody>, JsonRejection>,
) -> ApiResponse {
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("Invalid request: {e}"));
        }
    };

    let user = match state.users.verify_credentials(&body.username, &body.password) {
        Ok(u) => u,
        Err(e) => {
            let message = match e {
                StoreError::UserNotFound(_) => "User not found",
                StoreError::InvalidPassword => "Password does not match",
                StoreError::Disabled => "Account is disabled",
                other => return internal_error("Login failed", other),
            };
            tracing::warn!(username = %body.username, reason = message, "Login rejected");
            return error_response(StatusCode::BAD_REQUEST, message);
        }
    };

    let roles = match state.users.roles_of(&user.username) {
        Ok(r) => r,
        Err(e) => return internal_error("Login failed", e),
    };

    let tokens = state
        .tokens
        .issue_access_token(&user.username, &roles)
        .and_then(|access| {
            state
                .tokens
                .issue_refresh_token(&user.username)
                .map(|refresh| (access, refresh))
        });
    let (access_token, refresh_token) = match tokens {
        Ok(pair) => pair,
        Err(e) => return internal_error("Login failed", e),
    };

    if let Err(e) = state.users.update_last_login(&user.username) {
        tracing::warn!(username = %user.username, error = %e, "Failed to record login time");
    }

    tracing::info!(username = %user.username, "Login succeeded");
    token_response(&state, &user, &roles, &access_token, &refresh_token)
}

/// POST /api/auth/refresh: exchange a refresh token for a new access token.
async fn handle_refresh(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let Some(refresh_token) = extract_bearer_token(&headers) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid token format");
    };

    if !state.tokens.can_token_be_parsed(refresh_token)
        || !state.tokens.is_refresh_token(refresh_token)
    {
        return error_response(StatusCode::BAD_REQUEST, "Invalid refresh token");
    }

    let username = match state.tokens.get_username_from_token(refresh_token) {
        Ok(u) => u,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid refresh token"),
    };

    let user = match state.users.find_by_username(&username) {
        Ok(Some(u)) => u,
        Ok(None) => return error_response(StatusCode::BAD_REQUEST, "User not found"),
        Err(e) => return internal_error("Token refresh failed", e),
    };

    if !state.tokens.validate_token(refresh_token, &username) {
        return error_response(StatusCode::BAD_REQUEST, "Refresh token has expired");
    }

    let roles = match state.users.roles_of(&username) {
        Ok(r) => r,
        Err(e) => return internal_error("Token refresh failed", e),
    };
    let access_token = match state.tokens.issue_access_token(&username, &roles) {
        Ok(t) => t,
        Err(e) => return internal_error("Token refresh failed", e),
    };

    tracing::debug!(username = %username, "Access token refreshed");
    token_response(&state, &user, &roles, &access_token, refresh_token)
}

/// GET /api/auth/me: profile of the token's subject.
async fn handle_me(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let Some(token) = extract_bearer_token(&headers) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid token format");
    };

    if !state.tokens.can_token_be_parsed(token) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid token");
    }

    let username = match state.tokens.get_username_from_token(token) {
        Ok(u) => u,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid token"),
    };

    if !state.tokens.validate_token(token, &username) {
        return error_response(StatusCode::BAD_REQUEST, "Token has expired");
    }

    let user = match state.users.find_by_username(&username) {
        Ok(Some(u)) => u,
        Ok(None) => return error_response(StatusCode::BAD_REQUEST, "User not found"),
        Err(e) => return internal_error("User lookup failed", e),
    };

    let grants = state.users.roles_of(&username).and_then(|roles| {
        state
            .users
            .permissions_of(&username)
            .map(|perms| (roles, perms))
    });
    let (roles, permissions) = match grants {
        Ok(g) => g,
        Err(e) => return internal_error("User lookup failed", e),
    };
    let permissions: Vec<String> = permissions.into_iter().map(|p| p.name).collect();

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "id": user.id,
            "username": user.username,
            "name": user.name,
            "email": user.email,
            "roles": roles,
            "permissions": permissions,
            "enabled": user.enabled,
            "lastLoginAt": user.last_login_at,
        })),
    )
}

/// POST /api/auth/register: create a new account with the default role.
async fn handle_register(
    State(state): State<AppState>,
    body: Result<Json<RegisterBody>, JsonRejection>,
) -> ApiResponse {
    if !state.allow_registration {
        return error_response(StatusCode::FORBIDDEN, "Registration is disabled");
    }

    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("Invalid request: {e}"));
        }
    };

    if body.password.chars().count() < state.min_password_len {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!(
                "Password must be at least {} characters",
                state.min_password_len
            ),
        );
    }

    let name = if body.name.trim().is_empty() {
        body.username.as_str()
    } else {
        body.name.as_str()
    };

    match state
        .users
        .create_user(&body.username, &body.password, &body.email, name)
    {
        Ok(user) => registered_response(&user, state.users.roles_of(&user.username)),
        Err(e @ (StoreError::UsernameTaken(_) | StoreError::EmailTaken(_))) => {
            error_response(StatusCode::CONFLICT, e.to_string())
        }
        Err(StoreError::Validation(msg)) => error_response(StatusCode::BAD_REQUEST, msg),
        Err(e) => internal_error("Registration failed", e),
    }
}

/// `201` for a new account. A failed role read after the insert is a
/// server error, not an account without roles.
fn registered_response(user: &User, roles: Result<Vec<String>, StoreError>) -> ApiResponse {
    let roles = match roles {
        Ok(r) => r,
        Err(e) => return internal_error("Registration failed", e),
    };
    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": user.id,
            "username": user.username,
            "name": user.name,
            "email": user.email,
            "roles": roles,
        })),
    )
}

/// PUT /api/users/me/password: change the caller's password.
async fn handle_change_password(
    State(state): State<AppState>,
    Extension(identity): Extension<RequestIdentity>,
    body: Result<Json<ChangePasswordBody>, JsonRejection>,
) -> ApiResponse {
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("Invalid request: {e}"));
        }
    };

    if body.new_password.chars().count() < state.min_password_len {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!(
                "Password must be at least {} characters",
                state.min_password_len
            ),
        );
    }

    match state
        .users
        .change_password(&identity.username, &body.old_password, &body.new_password)
    {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "password_changed"})),
        ),
        Err(StoreError::InvalidPassword) => {
            error_response(StatusCode::BAD_REQUEST, "Current password does not match")
        }
        Err(StoreError::UserNotFound(_)) => {
            error_response(StatusCode::BAD_REQUEST, "User not found")
        }
        Err(e) => internal_error("Password change failed", e),
    }
}
