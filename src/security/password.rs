//! Salted SHA-256 credential records.
//!
//! A credential record is `base64(salt) + ":" + base64(sha256(salt || password))`.
//! Every `encode` call draws a fresh 16-byte salt from the OS RNG, so two
//! encodings of the same plaintext never match each other while both verify.
//!
//! This is a single-pass salted digest, not an iterated or memory-hard KDF.
//! It keeps the on-disk format of the existing user table readable; do not
//! reuse it for new credential stores.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Salt byte length for credential records.
pub const SALT_BYTES: usize = 16;

/// Separator between the encoded salt and the encoded digest.
const RECORD_SEPARATOR: char = ':';

/// Encodes and verifies stored passwords.
///
/// Stateless; a single instance is shared across request tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct PasswordHasher;

impl PasswordHasher {
    pub fn new() -> Self {
        Self
    }

    /// Produce a new credential record for `plaintext`.
    pub fn encode(&self, plaintext: &str) -> String {
        let salt = generate_salt();
        let digest = salted_digest(&salt, plaintext);
        format!(
            "{}{RECORD_SEPARATOR}{}",
            STANDARD.encode(salt),
            STANDARD.encode(digest)
        )
    }

    /// Check `plaintext` against a stored credential record.
    ///
    /// Malformed records and wrong passwords are indistinguishable: both
    /// return `false`.
    pub fn matches(&self, plaintext: &str, encoded: &str) -> bool {
        let mut parts = encoded.split(RECORD_SEPARATOR);
        let (Some(salt_b64), Some(stored_digest), None) =
            (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };

        let Ok(salt) = STANDARD.decode(salt_b64) else {
            return false;
        };

        let candidate = STANDARD.encode(salted_digest(&salt, plaintext));
        constant_time_eq(candidate.as_bytes(), stored_digest.as_bytes())
    }
}

// ── Cryptographic Helpers ───────────────────────────────────────────

/// Generate a random salt.
fn generate_salt() -> [u8; SALT_BYTES] {
    let mut bytes = [0u8; SALT_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// SHA-256 over `salt || plaintext`.
fn salted_digest(salt: &[u8], plaintext: &str) -> [u8; 32] {
    let mut hash = Sha256::new();
    hash.update(salt);
    hash.update(plaintext.as_bytes());
    hash.finalize().into()
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ── Tests ───────────────────────────────────────────────────────────
