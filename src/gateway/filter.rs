//! Bearer-token authentication filter.
//!
//! Every request passes through [`AuthLayer`]:
//!
//! 1. CORS headers are set on whatever response leaves the filter.
//! 2. `OPTIONS` is answered with an empty `200 OK`.
//! 3. The path is classified by the [`RouteTable`]; `Public` routes go
//!    straight to the inner service.
//! 4. Protected routes need `Authorization: Bearer <token>`, a token that
//!    parses under our signature, a subject that exists in the user store
//!    and a token that still validates for that subject. On success a
//!    [`RequestIdentity`] is attached as a request extension.
//!
//! Every denial is a `401` with the same JSON shape; only the message
//! differs.

use crate::auth::token::BEARER_PREFIX;
use crate::auth::{TokenService, UserLookup};
use crate::config::AuthConfig;
use axum::{
    body::{Bytes, HttpBody},
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    BoxError,
};
use chrono::Utc;
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};

pub const CORS_ALLOW_ORIGIN: &str = "*";
pub const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
pub const CORS_ALLOW_HEADERS: &str = "Authorization, Content-Type";
pub const UNAUTHORIZED_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

/// Routes that never require a token.
const DEFAULT_PUBLIC_ROUTES: &[&str] = &[
    "/",
    "/api/auth/*",
    "/api/health/*",
    "/static/*",
    "/public/*",
];

/// Prefixes the legacy deployment left open while board auth was unfinished.
const LEGACY_PUBLIC_PREFIXES: &[&str] = &[
    "/api/boards/*",
    "/api/openstack/*",
    "/api/integrated/*",
];

// ── Route classification ────────────────────────────────────────────

/// Whether a route needs a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Protected,
}

/// How a route entry matches a request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePattern {
    Exact(String),
    Prefix(String),
}

impl RoutePattern {
    /// `"/static/*"` is a prefix pattern, anything else is exact.
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(exact) => path == exact,
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

/// Ordered route table, built once at startup. First match wins; paths
/// with no match are `Protected`.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<(RoutePattern, Access)>,
}

impl RouteTable {
    /// Empty table: every path is protected.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_route(mut self, pattern: RoutePattern, access: Access) -> Self {
        self.routes.push((pattern, access));
        self
    }

    #[must_use]
    pub fn with_public(self, pattern: &str) -> Self {
        self.with_route(RoutePattern::parse(pattern), Access::Public)
    }

    /// The reviewed public set: auth endpoints, health, root and static
    /// assets.
    pub fn default_public() -> Self {
        DEFAULT_PUBLIC_ROUTES
            .iter()
            .fold(Self::new(), |table, pattern| table.with_public(pattern))
    }

    /// Adds the legacy open prefixes for boards, openstack and integrated
    /// APIs.
    #[must_use]
    pub fn with_legacy_public_prefixes(self) -> Self {
        LEGACY_PUBLIC_PREFIXES
            .iter()
            .fold(self, |table, pattern| table.with_public(pattern))
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        let table = if config.public_routes.is_empty() {
            Self::default_public()
        } else {
            config
                .public_routes
                .iter()
                .fold(Self::new(), |table, pattern| table.with_public(pattern))
        };

        if config.legacy_public_prefixes {
            tracing::warn!(
                prefixes = ?LEGACY_PUBLIC_PREFIXES,
                "Legacy public prefixes enabled; these routes bypass authentication"
            );
            table.with_legacy_public_prefixes()
        } else {
            table
        }
    }

    pub fn classify(&self, path: &str) -> Access {
        self.routes
            .iter()
            .find(|(pattern, _)| pattern.matches(path))
            .map_or(Access::Protected, |(_, access)| *access)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// ── Validation pipeline ─────────────────────────────────────────────

/// Identity attached to an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub username: String,
    pub token: String,
}

/// Reasons a protected request is denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// No `Authorization` header, or not a `Bearer` credential.
    MissingToken,
    /// Empty bearer credential, or a token that does not parse or whose
    /// signature does not verify.
    InvalidToken,
    /// Token subject is not a known user.
    UserNotFound,
    /// Token expired, or its subject no longer matches.
    ExpiredOrInvalid,
    /// Unexpected failure while checking the token. The detail is logged,
    /// never returned to the client.
    Internal(String),
}

impl AuthFailure {
    pub fn message(&self) -> &'static str {
        match self {
            Self::MissingToken => "authentication token required",
            Self::InvalidToken => "invalid token",
            Self::UserNotFound => "user not found",
            Self::ExpiredOrInvalid => "expired or invalid token",
            Self::Internal(_) => "error while processing token",
        }
    }
}

/// Immutable collaborators shared by every request.
#[derive(Clone)]
pub struct AuthGate {
    tokens: Arc<TokenService>,
    users: Arc<dyn UserLookup>,
    routes: Arc<RouteTable>,
}

impl AuthGate {
    pub fn new(tokens: Arc<TokenService>, users: Arc<dyn UserLookup>, routes: RouteTable) -> Self {
        Self {
            tokens,
            users,
            routes: Arc::new(routes),
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Run the token checks for a protected request.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<RequestIdentity, AuthFailure> {
        let credential = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.starts_with(BEARER_PREFIX))
            .ok_or(AuthFailure::MissingToken)?;
        // A bearer credential with nothing after the prefix is a bad token, not a missing one.
        let token = TokenService::extract_token_from_header(credential)
            .ok_or(AuthFailure::InvalidToken)?;

        if !self.tokens.can_token_be_parsed(token) {
            return Err(AuthFailure::InvalidToken);
        }

        let username = self
            .tokens
            .get_username_from_token(token)
            .map_err(|e| AuthFailure::Internal(format!("subject decode failed: {e}")))?;

        match self.users.find_by_username(&username) {
            Ok(Some(_)) => {}
            Ok(None) => return Err(AuthFailure::UserNotFound),
            Err(e) => return Err(AuthFailure::Internal(format!("user lookup failed: {e}"))),
        }

        if !self.tokens.validate_token(token, &username) {
            return Err(AuthFailure::ExpiredOrInvalid);
        }

        Ok(RequestIdentity {
            username,
            token: token.to_string(),
        })
    }
}

// ── Responses ───────────────────────────────────────────────────────

/// Set the permissive CORS headers on a response.
pub fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static(CORS_ALLOW_ORIGIN),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
}

/// `401` with `{"error": "Unauthorized", "message", "timestamp"}`.
pub fn unauthorized_response(message: &str) -> Response {
    let body = serde_json::json!({
        "error": "Unauthorized",
        "message": message,
        "timestamp": Utc::now().timestamp_millis(),
    });

    (
        StatusCode::UNAUTHORIZED,
        [(header::CONTENT_TYPE, UNAUTHORIZED_CONTENT_TYPE)],
        body.to_string(),
    )
        .into_response()
}

fn log_denial(path: &str, failure: &AuthFailure) {
    match failure {
        AuthFailure::Internal(detail) => {
            tracing::error!(path = %path, detail = %detail, "Token processing failed");
        }
        _ => tracing::warn!(path = %path, reason = failure.message(), "Request denied"),
    }
}

// ── Tower plumbing ──────────────────────────────────────────────────

/// Layer for authentication middleware.
#[derive(Clone)]
pub struct AuthLayer {
    gate: AuthGate,
}

impl AuthLayer {
    pub fn new(gate: AuthGate) -> Self {
        Self { gate }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            gate: self.gate.clone(),
        }
    }
}

/// Authentication service wrapper.
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    gate: AuthGate,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AuthService<S>
where
    S: Service<Request<ReqBody>, Response = axum::http::Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
    ResBody: HttpBody<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let gate = self.gate.clone();
        // The ready service goes into the future; a fresh clone stays behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            if request.method() == Method::OPTIONS {
                let mut response = StatusCode::OK.into_response();
                apply_cors_headers(response.headers_mut());
                return Ok(response);
            }

            let path = request.uri().path().to_owned();

            let mut response = match gate.routes.classify(&path) {
                Access::Public => inner.call(request).await?.into_response(),
                Access::Protected => match gate.authenticate(request.headers()) {
                    Ok(identity) => {
                        tracing::debug!(
                            path = %path,
                            username = %identity.username,
                            "Request authenticated"
                        );
                        request.extensions_mut().insert(identity);
                        inner.call(request).await?.into_response()
                    }
                    Err(failure) => {
                        log_denial(&path, &failure);
                        unauthorized_response(failure.message())
                    }
                },
            };

            apply_cors_headers(response.headers_mut());
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Claims, StoreError, TokenKind, User};
    use axum::{body::Body, routing::get, Extension, Router};
    use http_body_util::BodyExt;
    use std::collections::HashSet;
    use tower::ServiceExt;

    const SECRET: &[u8] = b"filter-test-secret";

    struct StaticUsers(HashSet<String>);

    impl UserLookup for StaticUsers {
        fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
            Ok(self.0.contains(username).then(|| User {
                id: 1,
                username: username.to_string(),
                password: String::new(),
                email: format!("{username}@example.com"),
                name: username.to_string(),
                enabled: true,
                created_at: 0,
                updated_at: 0,
                last_login_at: None,
            }))
        }
    }

    struct BrokenUsers;

    impl UserLookup for BrokenUsers {
        fn find_by_username(&self, _username: &str) -> Result<Option<User>, StoreError> {
            Err(StoreError::Validation("database is locked".into()))
        }
    }

    fn tokens() -> Arc<TokenService> {
        Arc::new(TokenService::new(SECRET, 3600, 7200))
    }

    fn app_with(users: Arc<dyn UserLookup>, routes: RouteTable) -> Router {
        let gate = AuthGate::new(tokens(), users, routes);
        Router::new()
            .route("/api/auth/login", get(|| async { "login" }))
            .route("/api/boards/1", get(|| async { "board" }))
            .route(
                "/api/private",
                get(|Extension(identity): Extension<RequestIdentity>| async move {
                    identity.username
                }),
            )
            .layer(AuthLayer::new(gate))
    }

    fn app() -> Router {
        let users: Arc<dyn UserLookup> =
            Arc::new(StaticUsers(["alice".to_string()].into_iter().collect()));
        app_with(users, RouteTable::default_public())
    }

    fn get_request(path: &str, auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(value) = auth {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn assert_cors(response: &Response) {
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], CORS_ALLOW_ORIGIN);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], CORS_ALLOW_METHODS);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], CORS_ALLOW_HEADERS);
    }

    #[test]
    fn route_pattern_parse() {
        assert_eq!(RoutePattern::parse("/"), RoutePattern::Exact("/".into()));
        assert_eq!(
            RoutePattern::parse("/static/*"),
            RoutePattern::Prefix("/static/".into())
        );
    }

    #[test]
    fn default_table_classification() {
        let table = RouteTable::default_public();
        assert_eq!(table.classify("/"), Access::Public);
        assert_eq!(table.classify("/api/auth/login"), Access::Public);
        assert_eq!(table.classify("/static/app.js"), Access::Public);
        assert_eq!(table.classify("/public/logo.png"), Access::Public);
        assert_eq!(table.classify("/api/health/status"), Access::Public);

        assert_eq!(table.classify("/index.html"), Access::Protected);
        assert_eq!(table.classify("/api/auth"), Access::Protected);
        assert_eq!(table.classify("/api/boards/1"), Access::Protected);
        assert_eq!(table.classify("/api/users/me/password"), Access::Protected);
    }

    #[test]
    fn legacy_prefixes_open_board_routes() {
        let config = AuthConfig {
            legacy_public_prefixes: true,
            ..AuthConfig::default()
        };
        let table = RouteTable::from_config(&config);
        assert_eq!(table.classify("/api/boards/7"), Access::Public);
        assert_eq!(table.classify("/api/openstack/deploy"), Access::Public);
        assert_eq!(table.classify("/api/integrated/x"), Access::Public);
        assert_eq!(table.classify("/api/users"), Access::Protected);
    }

    #[test]
    fn configured_routes_replace_defaults() {
        let config = AuthConfig {
            public_routes: vec!["/health".into(), "/docs/*".into()],
            ..AuthConfig::default()
        };
        let table = RouteTable::from_config(&config);
        assert_eq!(table.len(), 2);
        assert_eq!(table.classify("/health"), Access::Public);
        assert_eq!(table.classify("/docs/openapi.json"), Access::Public);
        assert_eq!(table.classify("/api/auth/login"), Access::Protected);
    }

    #[test]
    fn empty_table_protects_everything() {
        let table = RouteTable::new();
        assert!(table.is_empty());
        assert_eq!(table.classify("/"), Access::Protected);
    }

    #[tokio::test]
    async fn public_path_needs_no_token() {
        let response = app()
            .oneshot(get_request("/api/auth/login", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_cors(&response);
        assert_eq!(body_text(response).await, "login");
    }

    #[tokio::test]
    async fn options_short_circuits_on_protected_path() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/private")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_cors(&response);
        assert!(body_text(response).await.is_empty());
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        let response = app().oneshot(get_request("/api/private", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            UNAUTHORIZED_CONTENT_TYPE
        );
        assert_cors(&response);

        let body = body_json(response).await;
        assert_eq!(body["error"], "Unauthorized");
        assert_eq!(body["message"], "authentication token required");
        assert!(body["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn non_bearer_scheme_is_unauthorized() {
        let response = app()
            .oneshot(get_request("/api/private", Some("Basic YWxpY2U6cHc=")))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["message"], "authentication token required");
    }

    #[tokio::test]
    async fn empty_bearer_credential_is_invalid() {
        for value in ["Bearer ", "Bearer    "] {
            let response = app()
                .oneshot(get_request("/api/private", Some(value)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(body_json(response).await["message"], "invalid token");
        }
    }

    #[tokio::test]
    async fn garbage_token_is_invalid() {
        let response = app()
            .oneshot(get_request("/api/private", Some("Bearer not.a.token")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["message"], "invalid token");
    }

    #[tokio::test]
    async fn foreign_signature_is_invalid() {
        let foreign = TokenService::new(b"someone-else", 3600, 3600)
            .issue_access_token("alice", &[])
            .unwrap();
        let response = app()
            .oneshot(get_request("/api/private", Some(&format!("Bearer {foreign}"))))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["message"], "invalid token");
    }

    #[tokio::test]
    async fn unknown_subject_is_rejected() {
        let token = tokens().issue_access_token("mallory", &[]).unwrap();
        let response = app()
            .oneshot(get_request("/api/private", Some(&format!("Bearer {token}"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["message"], "user not found");
    }

    #[tokio::test]
    async fn expired_token_differs_only_in_message() {
        let now = Utc::now().timestamp();
        let token = tokens()
            .sign(&Claims {
                sub: "alice".into(),
                iat: now - 7200,
                exp: now - 3600,
                typ: TokenKind::Access,
                roles: Vec::new(),
            })
            .unwrap();

        let expired = app()
            .oneshot(get_request("/api/private", Some(&format!("Bearer {token}"))))
            .await
            .unwrap();
        let missing = app().oneshot(get_request("/api/private", None)).await.unwrap();

        assert_eq!(expired.status(), missing.status());
        let expired = body_json(expired).await;
        let missing = body_json(missing).await;
        assert_eq!(expired["error"], missing["error"]);
        assert_eq!(expired["message"], "expired or invalid token");
        assert_ne!(expired["message"], missing["message"]);
    }

    #[tokio::test]
    async fn valid_token_attaches_identity() {
        let token = tokens().issue_access_token("alice", &[]).unwrap();
        let response = app()
            .oneshot(get_request("/api/private", Some(&format!("Bearer {token}"))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_cors(&response);
        assert_eq!(body_text(response).await, "alice");
    }

    #[tokio::test]
    async fn lookup_failure_becomes_generic_unauthorized() {
        let users: Arc<dyn UserLookup> = Arc::new(BrokenUsers);
        let token = tokens().issue_access_token("alice", &[]).unwrap();
        let response = app_with(users, RouteTable::default_public())
            .oneshot(get_request("/api/private", Some(&format!("Bearer {token}"))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["message"], "error while processing token");
        assert!(!body["message"].as_str().unwrap().contains("locked"));
    }

    #[tokio::test]
    async fn board_routes_are_protected_by_default() {
        let response = app().oneshot(get_request("/api/boards/1", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn legacy_table_opens_board_routes() {
        let users: Arc<dyn UserLookup> = Arc::new(StaticUsers(HashSet::new()));
        let routes = RouteTable::default_public().with_legacy_public_prefixes();
        let response = app_with(users, routes)
            .oneshot(get_request("/api/boards/1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn failure_messages_are_distinct() {
        let failures = [
            AuthFailure::MissingToken,
            AuthFailure::InvalidToken,
            AuthFailure::UserNotFound,
            AuthFailure::ExpiredOrInvalid,
            AuthFailure::Internal("x".into()),
        ];
        let messages: HashSet<_> = failures.iter().map(AuthFailure::message).collect();
        assert_eq!(messages.len(), failures.len());
    }
}
