//! Credential primitives.
//!
//! `password` produces and checks the `salt:digest` records stored in the
//! user table.

pub mod password;

pub use password::PasswordHasher;
