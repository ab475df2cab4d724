//! Secret suppliers.
//!
//! The fleet primary key lives in a secret store. [`VaultSecretsClient`]
//! fetches it with a bearer token obtained from a managed-identity endpoint,
//! refreshing the token once if the store rejects it.
//!
//! Falls back to a plain environment variable when no identity endpoint is
//! configured (useful for local development / CI).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

const VAULT_RESOURCE: &str = "https://vault.azure.net";
const IDENTITY_API_VERSION: &str = "2017-09-01";
const SECRET_API_VERSION: &str = "2016-10-01";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("unable to get secret store token: {0}")]
    Token(String),
    #[error("secret store rejected the token for '{0}'")]
    Unauthorized(String),
    #[error("secret store returned status {status} for '{reference}'")]
    Status { reference: String, status: u16 },
    #[error("secret store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("secret '{reference}' not available and env var '{env_var}' is not set")]
    NotConfigured { reference: String, env_var: String },
}

/// Source of named secrets.
#[async_trait]
pub trait SecretSupplier: Send + Sync {
    /// Fetch the secret at `reference`. `force_refresh` discards any cached
    /// credential used to reach the store before fetching.
    async fn get_secret(&self, reference: &str, force_refresh: bool) -> Result<String, SecretError>;
}

/// Managed-identity endpoint used to obtain secret store tokens.
#[derive(Debug, Clone)]
pub struct IdentityEndpoint {
    pub url: String,
    pub secret: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct SecretResponse {
    value: String,
}

/// Client for a key-vault style secret store.
pub struct VaultSecretsClient {
    identity: Option<IdentityEndpoint>,
    /// Env var consulted when `identity` is absent.
    env_fallback: String,
    token: RwLock<Option<String>>,
    http: reqwest::Client,
}

impl VaultSecretsClient {
    pub fn new(identity: Option<IdentityEndpoint>, env_fallback: impl Into<String>) -> Self {
        Self {
            identity,
            env_fallback: env_fallback.into(),
            token: RwLock::new(None),
            http: reqwest::Client::new(),
        }
    }

    async fn bearer_token(
        &self,
        identity: &IdentityEndpoint,
        force_refresh: bool,
    ) -> Result<String, SecretError> {
        if !force_refresh {
            if let Some(token) = self.token.read().await.as_ref() {
                return Ok(token.clone());
            }
        }

        info!("requesting new secret store token");
        let url = format!(
            "{}/?resource={VAULT_RESOURCE}&api-version={IDENTITY_API_VERSION}",
            identity.url.trim_end_matches('/')
        );
        let resp = self
            .http
            .get(&url)
            .header("Secret", &identity.secret)
            .send()
            .await
            .map_err(|e| SecretError::Token(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(SecretError::Token(format!(
                "identity endpoint returned status {}",
                resp.status()
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SecretError::Token(e.to_string()))?;

        *self.token.write().await = Some(body.access_token.clone());
        Ok(body.access_token)
    }

    async fn fetch(&self, reference: &str, token: &str) -> Result<String, SecretError> {
        let url = format!("{reference}?api-version={SECRET_API_VERSION}");
        let resp = self.http.get(&url).bearer_auth(token).send().await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => Err(SecretError::Unauthorized(reference.to_owned())),
            status if !status.is_success() => Err(SecretError::Status {
                reference: reference.to_owned(),
                status: status.as_u16(),
            }),
            _ => {
                let body: SecretResponse = resp.json().await?;
                Ok(body.value)
            }
        }
    }
}

#[async_trait]
impl SecretSupplier for VaultSecretsClient {
    async fn get_secret(&self, reference: &str, force_refresh: bool) -> Result<String, SecretError> {
        let Some(identity) = &self.identity else {
            return std::env::var(&self.env_fallback).map_err(|_| SecretError::NotConfigured {
                reference: reference.to_owned(),
                env_var: self.env_fallback.clone(),
            });
        };

        let token = self.bearer_token(identity, force_refresh).await?;
        match self.fetch(reference, &token).await {
            Err(SecretError::Unauthorized(_)) if !force_refresh => {
                warn!(reference, "secret store token rejected, refreshing once");
                let token = self.bearer_token(identity, true).await?;
                self.fetch(reference, &token).await
            }
            other => other,
        }
    }
}

// ------------------------------------------------------------------ //
//  StaticSecret (for tests)                                           //
// ------------------------------------------------------------------ //

/// Supplier that always returns the same value and counts fetches.
#[derive(Debug, Clone)]
pub struct StaticSecret {
    value: String,
    fetches: Arc<AtomicUsize>,
}

impl StaticSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretSupplier for StaticSecret {
    async fn get_secret(&self, _reference: &str, _force_refresh: bool) -> Result<String, SecretError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.value.clone())
    }
}
