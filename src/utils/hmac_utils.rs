use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{ImageVaultError, Result};

pub type HmacSha256 = Hmac<Sha256>;

pub const HMAC_TAG_LEN: usize = 32;

/// Hex-encoded HMAC-SHA256 tag of `message`.
pub fn sign_hex(message: &[u8], secret_key: &[u8]) -> Result<String> {
    let mut mac = new_mac(secret_key)?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex tag produced by [`sign_hex`].
/// Malformed hex is a mismatch, not an error.
pub fn verify_hex(message: &[u8], tag_hex: &str, secret_key: &[u8]) -> Result<bool> {
    let tag = match hex::decode(tag_hex) {
        Ok(tag) if tag.len() == HMAC_TAG_LEN => tag,
        _ => return Ok(false),
    };

    let mut mac = new_mac(secret_key)?;
    mac.update(message);
    Ok(mac.verify_slice(&tag).is_ok())
}

fn new_mac(secret_key: &[u8]) -> Result<HmacSha256> {
    if secret_key.is_empty() {
        return Err(ImageVaultError::Validation(
            "Signing key must not be empty".into(),
        ));
    }
    HmacSha256::new_from_slice(secret_key)
        .map_err(|e| ImageVaultError::Internal(format!("HMAC key error: {}", e)))
}
