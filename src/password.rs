//! Argon2id password hashing for user records.
//!
//! Hashes use the PHC string format so the algorithm parameters and salt
//! travel with the hash.

use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};

use crate::error::{ImageVaultError, Result};

pub const MIN_PASSWORD_LEN: usize = 8;

// Well-formed Argon2id hash with default parameters that no password matches.
const DUMMY_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$/ikZZqXbKhYQ8zpunsHHew$2/m46z21JXV2BVSbgvmVSllneV5ue5hoH1Z8Y/+w1E4";

/// Hash a plaintext password using Argon2id with a random salt.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::encode_b64(&rand::random::<[u8; 16]>())
        .map_err(|e| ImageVaultError::Internal(format!("password salt generation failed: {}", e)))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ImageVaultError::Internal(format!("password hashing failed: {}", e)))
}

/// `Ok(false)` for a wrong password; `Err` only when `hash` is not a PHC string.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| ImageVaultError::Internal(format!("stored password hash is invalid: {}", e)))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(ImageVaultError::Internal(format!(
            "password verification failed: {}",
            e
        ))),
    }
}

/// Run a full Argon2 verification against a hash nothing matches. Used when
/// there is no stored hash to check.
pub fn verify_against_dummy(password: &str) {
    let _ = verify_password(password, DUMMY_HASH);
}

pub fn validate_password_strength(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ImageVaultError::Validation(format!(
            "Password must be at least {} characters long",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}
