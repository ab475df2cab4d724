//! TelemetryTransport trait and implementations.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use device_identity::{sas, ConnectionDescriptor};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_HUB_API_VERSION: &str = "2020-03-13";
pub const CREATION_TIME_PROPERTY: &str = "iothub-creation-time-utc";

// ------------------------------------------------------------------ //
//  Domain types                                                       //
// ------------------------------------------------------------------ //

/// One device-to-cloud message.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub message_id: Uuid,
    /// Serialised JSON payload.
    pub body: String,
    pub content_type: &'static str,
    pub content_encoding: &'static str,
    /// Application properties.
    pub properties: BTreeMap<String, String>,
}

impl TelemetryMessage {
    pub fn json(body: String) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            body,
            content_type: "application/json",
            content_encoding: "utf-8",
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<String>) -> Self {
        self.properties.insert(name.to_owned(), value.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The hub no longer knows this device, e.g. it was deleted after provisioning.
    #[error("DeviceNotFound: device is not registered on {host}")]
    IdentityNotFound { host: String },
    #[error("hub rejected the message with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("hub request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("session already closed")]
    Closed,
}

impl DeliveryError {
    pub fn is_identity_not_found(&self) -> bool {
        matches!(self, DeliveryError::IdentityNotFound { .. })
    }
}

// ------------------------------------------------------------------ //
//  Traits                                                             //
// ------------------------------------------------------------------ //

/// Opens telemetry sessions for resolved device connections.
#[async_trait]
pub trait TelemetryTransport: Send + Sync {
    async fn open(
        &self,
        connection: &ConnectionDescriptor,
    ) -> Result<Box<dyn TelemetrySession>, DeliveryError>;
}

#[async_trait]
pub trait TelemetrySession: Send {
    async fn send(&mut self, message: &TelemetryMessage) -> Result<(), DeliveryError>;
    async fn close(self: Box<Self>) -> Result<(), DeliveryError>;
}

// ------------------------------------------------------------------ //
//  HttpHubTransport (production)                                      //
// ------------------------------------------------------------------ //

/// Sends device-to-cloud messages over the hub's HTTPS endpoint.
pub struct HttpHubTransport {
    scheme: String,
    api_version: String,
    token_ttl: Duration,
    http: reqwest::Client,
}

impl Default for HttpHubTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpHubTransport {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            scheme: "https".to_string(),
            api_version: DEFAULT_HUB_API_VERSION.to_string(),
            token_ttl: sas::DEFAULT_TTL,
            http,
        }
    }

    /// Use plain HTTP instead of HTTPS (local hubs and tests).
    pub fn with_scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.to_string();
        self
    }
}

#[async_trait]
impl TelemetryTransport for HttpHubTransport {
    async fn open(
        &self,
        connection: &ConnectionDescriptor,
    ) -> Result<Box<dyn TelemetrySession>, DeliveryError> {
        let token = sas::device_token(
            &connection.host_name,
            &connection.device_id,
            &connection.shared_access_key,
            self.token_ttl,
        )
        .map_err(|e| DeliveryError::InvalidDescriptor(e.to_string()))?;

        let url = format!(
            "{}://{}/devices/{}/messages/events?api-version={}",
            self.scheme,
            connection.host_name,
            urlencoding::encode(&connection.device_id),
            self.api_version
        );

        debug!(device_id = %connection.device_id, host = %connection.host_name, "opening hub session");
        Ok(Box::new(HttpHubSession {
            http: self.http.clone(),
            host: connection.host_name.clone(),
            url,
            token: Some(token.to_string()),
        }))
    }
}

struct HttpHubSession {
    http: reqwest::Client,
    host: String,
    url: String,
    /// `None` once closed.
    token: Option<String>,
}

#[async_trait]
impl TelemetrySession for HttpHubSession {
    async fn send(&mut self, message: &TelemetryMessage) -> Result<(), DeliveryError> {
        let token = self.token.as_deref().ok_or(DeliveryError::Closed)?;

        let mut request = self
            .http
            .post(&self.url)
            .header(reqwest::header::AUTHORIZATION, token)
            .header(reqwest::header::CONTENT_TYPE, message.content_type)
            .header("iothub-messageid", message.message_id.to_string())
            .header("iothub-contenttype", message.content_type)
            .header("iothub-contentencoding", message.content_encoding);
        for (name, value) in &message.properties {
            request = request.header(format!("iothub-app-{name}"), value);
        }

        let resp = request.body(message.body.clone()).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(DeliveryError::IdentityNotFound {
                host: self.host.clone(),
            }),
            status if !status.is_success() => Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }

    async fn close(mut self: Box<Self>) -> Result<(), DeliveryError> {
        self.token.take().map(|_| ()).ok_or(DeliveryError::Closed)
    }
}

// ------------------------------------------------------------------ //
//  FakeTransport (for tests)                                          //
// ------------------------------------------------------------------ //

/// A message accepted by [`FakeTransport`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub connection: ConnectionDescriptor,
    pub message: TelemetryMessage,
}

/// Failure to inject into the next send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    IdentityNotFound,
    Rejected(u16),
}

/// In-memory transport that records sent messages for test assertions.
#[derive(Debug, Default, Clone)]
pub struct FakeTransport {
    pub sent: Arc<Mutex<Vec<SentMessage>>>,
    failures: Arc<Mutex<VecDeque<FakeFailure>>>,
    opened: Arc<Mutex<usize>>,
    closed: Arc<Mutex<usize>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next send fail with `failure`.
    pub fn fail_next_send(&self, failure: FakeFailure) {
        self.failures.lock().unwrap().push_back(failure);
    }

    /// Non-destructive snapshot of sent messages.
    pub fn snapshot(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn opened(&self) -> usize {
        *self.opened.lock().unwrap()
    }

    pub fn closed(&self) -> usize {
        *self.closed.lock().unwrap()
    }
}

#[async_trait]
impl TelemetryTransport for FakeTransport {
    async fn open(
        &self,
        connection: &ConnectionDescriptor,
    ) -> Result<Box<dyn TelemetrySession>, DeliveryError> {
        *self.opened.lock().unwrap() += 1;
        Ok(Box::new(FakeSession {
            transport: self.clone(),
            connection: connection.clone(),
        }))
    }
}

struct FakeSession {
    transport: FakeTransport,
    connection: ConnectionDescriptor,
}

#[async_trait]
impl TelemetrySession for FakeSession {
    async fn send(&mut self, message: &TelemetryMessage) -> Result<(), DeliveryError> {
        let failure = self.transport.failures.lock().unwrap().pop_front();
        match failure {
            Some(FakeFailure::IdentityNotFound) => Err(DeliveryError::IdentityNotFound {
                host: self.connection.host_name.clone(),
            }),
            Some(FakeFailure::Rejected(status)) => Err(DeliveryError::Rejected {
                status,
                body: String::new(),
            }),
            None => {
                self.transport.sent.lock().unwrap().push(SentMessage {
                    connection: self.connection.clone(),
                    message: message.clone(),
                });
                Ok(())
            }
        }
    }

    async fn close(self: Box<Self>) -> Result<(), DeliveryError> {
        *self.transport.closed.lock().unwrap() += 1;
        Ok(())
    }
}
