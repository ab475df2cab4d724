//! Per-device key derivation.
//!
//! A device key is the base64-encoded HMAC-SHA256 of the device id, keyed with
//! the base64-decoded fleet primary key. It is a pure function of its inputs,
//! so every process derives the same key for the same device.

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

pub(crate) type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("key must not be empty")]
    Empty,
}

/// Derive the device key for `device_id` from the fleet primary key.
pub fn derive_device_key(primary_key_b64: &str, device_id: &str) -> Result<String, KeyError> {
    let digest = hmac_sha256(primary_key_b64, device_id.as_bytes())?;
    Ok(STANDARD.encode(digest))
}

/// HMAC-SHA256 of `message` keyed with a base64-encoded key.
pub(crate) fn hmac_sha256(key_b64: &str, message: &[u8]) -> Result<Vec<u8>, KeyError> {
    let key = STANDARD.decode(key_b64.trim())?;
    if key.is_empty() {
        return Err(KeyError::Empty);
    }
    // HMAC accepts keys of any length, so this cannot fail for a non-empty key.
    let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| KeyError::Empty)?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}
