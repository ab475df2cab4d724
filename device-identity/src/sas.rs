//! Shared access signature (SAS) tokens.
//!
//! A token grants access to exactly one URL-encoded resource until its expiry:
//!
//! ```text
//! SharedAccessSignature sr={resource}&sig={signature}[&skn={key name}]&se={expiry}
//! ```
//!
//! The signature is `base64(HMAC-SHA256(key, "{resource}\n{expiry}"))`, URL-encoded.

use std::fmt;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

use crate::keys::{hmac_sha256, KeyError};

const TOKEN_PREFIX: &str = "SharedAccessSignature ";

/// Key name carried by provisioning-service registration tokens.
pub const REGISTRATION_KEY_NAME: &str = "registration";

/// Default token lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SasParseError {
    #[error("token does not start with 'SharedAccessSignature'")]
    MissingPrefix,
    #[error("token field '{0}' is missing")]
    MissingField(&'static str),
    #[error("token field '{0}' is malformed")]
    Malformed(&'static str),
}

/// A signed SAS token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasToken {
    /// URL-encoded resource URI.
    encoded_resource: String,
    /// Base64 signature, not URL-encoded.
    signature: String,
    key_name: Option<String>,
    /// Unix seconds.
    expiry: i64,
}

impl SasToken {
    /// Sign `resource` with `key_b64`, valid until the Unix time `expiry`.
    pub fn sign(
        resource: &str,
        key_b64: &str,
        key_name: Option<&str>,
        expiry: i64,
    ) -> Result<Self, KeyError> {
        let encoded_resource = urlencoding::encode(resource).into_owned();
        let digest = hmac_sha256(key_b64, string_to_sign(&encoded_resource, expiry).as_bytes())?;

        Ok(Self {
            encoded_resource,
            signature: STANDARD.encode(digest),
            key_name: key_name.map(str::to_owned),
            expiry,
        })
    }

    /// Parse a token previously produced by [`SasToken::to_string`].
    pub fn parse(token: &str) -> Result<Self, SasParseError> {
        let fields = token
            .strip_prefix(TOKEN_PREFIX)
            .ok_or(SasParseError::MissingPrefix)?;

        let mut encoded_resource = None;
        let mut signature = None;
        let mut key_name = None;
        let mut expiry = None;

        for pair in fields.split('&') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            match name {
                "sr" => encoded_resource = Some(value.to_owned()),
                "sig" => {
                    let decoded = urlencoding::decode(value)
                        .map_err(|_| SasParseError::Malformed("sig"))?;
                    signature = Some(decoded.into_owned());
                }
                "skn" => key_name = Some(value.to_owned()),
                "se" => {
                    expiry = Some(value.parse().map_err(|_| SasParseError::Malformed("se"))?);
                }
                _ => {}
            }
        }

        Ok(Self {
            encoded_resource: encoded_resource.ok_or(SasParseError::MissingField("sr"))?,
            signature: signature.ok_or(SasParseError::MissingField("sig"))?,
            key_name,
            expiry: expiry.ok_or(SasParseError::MissingField("se"))?,
        })
    }

    /// The decoded resource URI this token grants access to.
    pub fn resource(&self) -> String {
        urlencoding::decode(&self.encoded_resource)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| self.encoded_resource.clone())
    }

    pub fn encoded_resource(&self) -> &str {
        &self.encoded_resource
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn key_name(&self) -> Option<&str> {
        self.key_name.as_deref()
    }

    pub fn expiry(&self) -> i64 {
        self.expiry
    }

    /// The exact string the signature was computed over.
    pub fn string_to_sign(&self) -> String {
        string_to_sign(&self.encoded_resource, self.expiry)
    }
}

impl fmt::Display for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{TOKEN_PREFIX}sr={}&sig={}",
            self.encoded_resource,
            urlencoding::encode(&self.signature)
        )?;
        if let Some(key_name) = &self.key_name {
            write!(f, "&skn={key_name}")?;
        }
        write!(f, "&se={}", self.expiry)
    }
}

fn string_to_sign(encoded_resource: &str, expiry: i64) -> String {
    format!("{encoded_resource}\n{expiry}")
}

fn expiry_from_now(ttl: Duration) -> i64 {
    chrono::Utc::now().timestamp() + ttl.as_secs() as i64
}

/// Token authorising one registration of `device_id` within `scope_id`.
pub fn registration_token(
    scope_id: &str,
    device_id: &str,
    device_key: &str,
    ttl: Duration,
) -> Result<SasToken, KeyError> {
    SasToken::sign(
        &format!("{scope_id}/registrations/{device_id}"),
        device_key,
        Some(REGISTRATION_KEY_NAME),
        expiry_from_now(ttl),
    )
}

/// Token authorising `device_id` to send telemetry to `host`.
pub fn device_token(
    host: &str,
    device_id: &str,
    device_key: &str,
    ttl: Duration,
) -> Result<SasToken, KeyError> {
    SasToken::sign(
        &format!("{host}/devices/{device_id}"),
        device_key,
        None,
        expiry_from_now(ttl),
    )
}
