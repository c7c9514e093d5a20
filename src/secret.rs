//! One-way client secret hashing and verification.

use std::fmt;
use std::sync::OnceLock;

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};

use crate::error::{Error, Result};

const DUMMY_SECRET: &str = "unknown-client-placeholder";

/// Compares a presented secret against a stored one-way hash.
///
/// Implementations must take the same time whether or not the secret matches.
pub trait SecretVerifier: Send + Sync {
    /// Returns true when `secret` matches `hash`.
    fn verify(&self, secret: &str, hash: &str) -> bool;

    /// Burns the cost of one verification for an unknown client.
    fn verify_dummy(&self, secret: &str);
}

/// Argon2 verifier over PHC-formatted hashes.
#[derive(Default)]
pub struct Argon2Verifier {
    argon2: Argon2<'static>,
    dummy: OnceLock<Option<String>>,
}

impl fmt::Debug for Argon2Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Argon2Verifier").finish_non_exhaustive()
    }
}

impl Argon2Verifier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretVerifier for Argon2Verifier {
    fn verify(&self, secret: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        self.argon2
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok()
    }

    fn verify_dummy(&self, secret: &str) {
        let dummy = self
            .dummy
            .get_or_init(|| hash_secret(DUMMY_SECRET).ok());
        if let Some(hash) = dummy {
            let _ = self.verify(secret, hash);
        }
    }
}

/// Hashes a client secret into a PHC string for storage.
pub fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| Error::SecretHash(err.to_string()))
}
