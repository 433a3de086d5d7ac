//! HS256 bearer tokens.
//!
//! Access tokens carry the user's roles; refresh tokens carry only the
//! subject. Both are signed with the configured secret and are never stored
//! server-side. A token is `Valid` while its signature verifies and
//! `now < exp`; once `Expired` or `Invalid` it stays that way and the
//! client must log in again.

use crate::config::JwtConfig;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Required prefix of the `Authorization` header value.
pub const BEARER_PREFIX: &str = "Bearer ";

/// Largest accepted clock-skew tolerance, in seconds.
pub const MAX_LEEWAY_SECS: u64 = 300;

/// Token kind, carried in the `typ` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Claims embedded in every token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Username.
    pub sub: String,
    /// Issued at, Unix seconds.
    pub iat: i64,
    /// Expiration, Unix seconds.
    pub exp: i64,
    pub typ: TokenKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

/// Lifecycle state of a presented token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Valid,
    Expired,
    Invalid,
}

/// Token failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token subject does not match")]
    SubjectMismatch,

    #[error("token encoding failed: {0}")]
    Encoding(String),
}

/// Issues and validates bearer tokens.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
    leeway_secs: u64,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .field("leeway_secs", &self.leeway_secs)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(secret: &[u8], access_ttl_secs: u64, refresh_ttl_secs: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            access_ttl_secs: i64::try_from(access_ttl_secs).unwrap_or(i64::MAX),
            refresh_ttl_secs: i64::try_from(refresh_ttl_secs).unwrap_or(i64::MAX),
            leeway_secs: 0,
        }
    }

    pub fn from_config(config: &JwtConfig) -> Self {
        Self::new(
            config.secret.as_bytes(),
            config.access_ttl_secs,
            config.refresh_ttl_secs,
        )
        .with_leeway(config.leeway_secs)
    }

    /// Clock-skew tolerance for `exp`, clamped to [`MAX_LEEWAY_SECS`].
    #[must_use]
    pub fn with_leeway(mut self, leeway_secs: u64) -> Self {
        self.leeway_secs = leeway_secs.min(MAX_LEEWAY_SECS);
        self
    }

    /// Access token lifetime in milliseconds, as reported to clients.
    pub fn access_ttl_millis(&self) -> i64 {
        self.access_ttl_secs.saturating_mul(1000)
    }

    // ── Issuance ────────────────────────────────────────────────────

    pub fn issue_access_token(
        &self,
        username: &str,
        roles: &[String],
    ) -> Result<String, TokenError> {
        let now = Utc::now().timestamp();
        self.sign(&Claims {
            sub: username.to_string(),
            iat: now,
            exp: now.saturating_add(self.access_ttl_secs),
            typ: TokenKind::Access,
            roles: roles.to_vec(),
        })
    }

    pub fn issue_refresh_token(&self, username: &str) -> Result<String, TokenError> {
        let now = Utc::now().timestamp();
        self.sign(&Claims {
            sub: username.to_string(),
            iat: now,
            exp: now.saturating_add(self.refresh_ttl_secs),
            typ: TokenKind::Refresh,
            roles: Vec::new(),
        })
    }

    /// Sign arbitrary claims. Used by issuance and by tests that need
    /// tokens with a chosen `exp`.
    pub fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| TokenError::Encoding(e.to_string()))
    }

    // ── Inspection ──────────────────────────────────────────────────

    /// Strip the `Bearer ` prefix. `None` when the prefix is missing or
    /// nothing follows it.
    pub fn extract_token_from_header(header_value: &str) -> Option<&str> {
        header_value
            .strip_prefix(BEARER_PREFIX)
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    /// Structure and signature check, regardless of expiry and subject.
    pub fn can_token_be_parsed(&self, token: &str) -> bool {
        self.decode_claims(token, false).is_ok()
    }

    /// Subject of a signature-valid token. Expiry is not checked here.
    pub fn get_username_from_token(&self, token: &str) -> Result<String, TokenError> {
        self.decode_claims(token, false).map(|claims| claims.sub)
    }

    /// Roles carried by a signature-valid token.
    pub fn roles_from_token(&self, token: &str) -> Result<Vec<String>, TokenError> {
        self.decode_claims(token, false).map(|claims| claims.roles)
    }

    pub fn is_refresh_token(&self, token: &str) -> bool {
        matches!(
            self.decode_claims(token, false),
            Ok(Claims { typ: TokenKind::Refresh, .. })
        )
    }

    /// Full check: signature, expiry, and subject equal to `username`.
    pub fn validate_token(&self, token: &str, username: &str) -> bool {
        self.verify(token, username).is_ok()
    }

    /// Like [`validate_token`](Self::validate_token) but reports why a token
    /// was rejected.
    pub fn verify(&self, token: &str, username: &str) -> Result<Claims, TokenError> {
        let claims = self.decode_claims(token, true)?;
        if claims.sub != username {
            return Err(TokenError::SubjectMismatch);
        }
        Ok(claims)
    }

    pub fn status(&self, token: &str) -> TokenStatus {
        match self.decode_claims(token, true) {
            Ok(_) => TokenStatus::Valid,
            Err(TokenError::Expired) => TokenStatus::Expired,
            Err(_) => TokenStatus::Invalid,
        }
    }

    fn decode_claims(&self, token: &str, check_exp: bool) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256];
        validation.validate_exp = check_exp;
        validation.leeway = self.leeway_secs;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let claims = decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(map_jwt_error)?;

        // jsonwebtoken accepts `exp == now`; a token is valid only while `now < exp`.
        if check_exp && claims.exp.saturating_add(self.leeway_i64()) <= Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    fn leeway_i64(&self) -> i64 {
        i64::try_from(self.leeway_secs).unwrap_or(i64::MAX)
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> TokenError {
    match err.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::InvalidSignature => TokenError::InvalidSignature,
        ErrorKind::InvalidToken => TokenError::Malformed("not a JWT".into()),
        ErrorKind::InvalidAlgorithm => TokenError::Malformed("unsupported algorithm".into()),
        ErrorKind::Base64(_) => TokenError::Malformed("invalid base64 encoding".into()),
        ErrorKind::Json(_) => TokenError::Malformed("invalid claims".into()),
        ErrorKind::MissingRequiredClaim(claim) => {
            TokenError::Malformed(format!("missing claim {claim}"))
        }
        _ => TokenError::Malformed(err.to_string()),
    }
}
