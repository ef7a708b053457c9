//! LCP passphrases for patrons

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

const SECRET_LENGTH: usize = 32;

/// A patron's passphrase secret and its SHA-256 hex digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatronPassphrase {
    pub secret: String,
    pub hashed: String,
}

impl PatronPassphrase {
    /// Generate a new random secret
    pub fn generate() -> Self {
        let secret: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SECRET_LENGTH)
            .map(char::from)
            .collect();
        Self::from_secret(secret)
    }

    pub fn from_secret(secret: String) -> Self {
        let hashed = hash_secret(&secret);
        Self { secret, hashed }
    }

    /// Value sent to the distributor: base64 of the raw digest
    pub fn encoded(&self) -> AppResult<String> {
        encode_hashed(&self.hashed)
    }
}

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

pub fn encode_hashed(hashed: &str) -> AppResult<String> {
    let raw = hex::decode(hashed)
        .map_err(|e| AppError::Internal(format!("Stored passphrase hash is not hex: {}", e)))?;
    Ok(STANDARD.encode(raw))
}
