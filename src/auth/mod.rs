//! User authentication.
//!
//! Provides:
//! - HS256 bearer tokens (access + refresh) bound to a username and expiry
//! - SQLite-backed user store with roles and permissions
//!
//! ## Design Decisions
//! - Tokens are stateless; there is no server-side revocation list. A token
//!   that expired or failed verification is terminal and the client logs in
//!   again.
//! - The request filter depends only on the [`UserLookup`] trait, so the
//!   store can be swapped in tests.

pub mod store;
pub mod token;

pub use store::{Permission, StoreError, User, UserLookup, UserStore};
pub use token::{Claims, TokenError, TokenKind, TokenService, TokenStatus};
