//! Provisioning service protocol.
//!
//! Two calls, both authorised with a registration SAS token:
//!
//! ```text
//! PUT https://{host}/{scope}/registrations/{device}/register?api-version={v}
//! GET https://{host}/{scope}/registrations/{device}/operations/{operation}?api-version={v}
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ------------------------------------------------------------------ //
//  Wire types                                                         //
// ------------------------------------------------------------------ //

/// Body of the registration PUT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    #[serde(rename = "registrationId")]
    pub registration_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<RegistrationPayload>,
}

/// Optional custom data sent with a registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationPayload {
    #[serde(rename = "modelId")]
    pub model_id: String,
}

/// Response of both provisioning calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    #[serde(rename = "operationId", skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "registrationState", skip_serializing_if = "Option::is_none")]
    pub registration_state: Option<RegistrationState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrationState {
    #[serde(rename = "assignedHub", skip_serializing_if = "Option::is_none")]
    pub assigned_hub: Option<String>,
    #[serde(rename = "deviceId", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(rename = "errorMessage", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl OperationStatus {
    pub fn assigning(operation_id: &str) -> Self {
        Self {
            operation_id: Some(operation_id.to_owned()),
            status: Some("assigning".into()),
            registration_state: None,
        }
    }

    pub fn assigned(hub: &str) -> Self {
        Self {
            operation_id: None,
            status: Some("assigned".into()),
            registration_state: Some(RegistrationState {
                assigned_hub: Some(hub.to_owned()),
                ..Default::default()
            }),
        }
    }

    pub fn failed(error_code: i64) -> Self {
        Self {
            operation_id: None,
            status: Some("failed".into()),
            registration_state: Some(RegistrationState {
                error_code: Some(error_code),
                ..Default::default()
            }),
        }
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn assigned_hub(&self) -> Option<&str> {
        self.registration_state
            .as_ref()
            .and_then(|s| s.assigned_hub.as_deref())
            .filter(|hub| !hub.is_empty())
    }

    pub fn error_code(&self) -> Option<i64> {
        self.registration_state.as_ref().and_then(|s| s.error_code)
    }
}

// ------------------------------------------------------------------ //
//  Client trait                                                       //
// ------------------------------------------------------------------ //

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("provisioning request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provisioning service returned status {status}: {body}")]
    Status { status: u16, body: String },
}

impl ProvisioningError {
    /// HTTP status reported by the service, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProvisioningError::Status { status, .. } => Some(*status),
            ProvisioningError::Http(e) => e.status().map(|s| s.as_u16()),
        }
    }
}

/// Transport for the two provisioning calls.
#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    async fn register(
        &self,
        scope_id: &str,
        registration: &DeviceRegistration,
        sas_token: &str,
    ) -> Result<OperationStatus, ProvisioningError>;

    async fn operation_status(
        &self,
        scope_id: &str,
        device_id: &str,
        operation_id: &str,
        sas_token: &str,
    ) -> Result<OperationStatus, ProvisioningError>;
}

// ------------------------------------------------------------------ //
//  HttpProvisioningClient (production)                                //
// ------------------------------------------------------------------ //

pub struct HttpProvisioningClient {
    /// Scheme and host, e.g. `https://global.azure-devices-provisioning.net`.
    base_url: String,
    api_version: String,
    http: reqwest::Client,
}

impl HttpProvisioningClient {
    pub fn new(base_url: &str, api_version: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_version: api_version.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Client for `https://{host}`.
    pub fn for_host(host: &str, api_version: &str) -> Self {
        Self::new(&format!("https://{host}"), api_version)
    }

    fn registration_url(&self, scope_id: &str, device_id: &str) -> String {
        format!(
            "{}/{}/registrations/{}",
            self.base_url,
            urlencoding::encode(scope_id),
            urlencoding::encode(device_id)
        )
    }

    async fn decode(resp: reqwest::Response) -> Result<OperationStatus, ProvisioningError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProvisioningError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl ProvisioningClient for HttpProvisioningClient {
    async fn register(
        &self,
        scope_id: &str,
        registration: &DeviceRegistration,
        sas_token: &str,
    ) -> Result<OperationStatus, ProvisioningError> {
        let url = format!(
            "{}/register?api-version={}",
            self.registration_url(scope_id, &registration.registration_id),
            self.api_version
        );
        let resp = self
            .http
            .put(&url)
            .header(reqwest::header::AUTHORIZATION, sas_token)
            .json(registration)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn operation_status(
        &self,
        scope_id: &str,
        device_id: &str,
        operation_id: &str,
        sas_token: &str,
    ) -> Result<OperationStatus, ProvisioningError> {
        let url = format!(
            "{}/operations/{}?api-version={}",
            self.registration_url(scope_id, device_id),
            urlencoding::encode(operation_id),
            self.api_version
        );
        let resp = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, sas_token)
            .send()
            .await?;
        Self::decode(resp).await
    }
}

// ------------------------------------------------------------------ //
//  FakeProvisioningClient (for tests)                                 //
// ------------------------------------------------------------------ //

/// A call observed by [`FakeProvisioningClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisioningCall {
    Register {
        scope_id: String,
        registration: DeviceRegistration,
        sas_token: String,
    },
    OperationStatus {
        device_id: String,
        operation_id: String,
        sas_token: String,
    },
}

/// Scripted provisioning service.
///
/// `register` pops from the register script, `operation_status` from the
/// status script. An exhausted status script keeps answering with
/// `fallback_status` ("assigning" unless changed); an exhausted register
/// script answers "assigning" with operation id `op-1`.
#[derive(Debug, Clone)]
pub struct FakeProvisioningClient {
    register_script: Arc<Mutex<VecDeque<Result<OperationStatus, u16>>>>,
    status_script: Arc<Mutex<VecDeque<Result<OperationStatus, u16>>>>,
    fallback_status: OperationStatus,
    pub calls: Arc<Mutex<Vec<ProvisioningCall>>>,
}

impl Default for FakeProvisioningClient {
    fn default() -> Self {
        Self {
            register_script: Arc::default(),
            status_script: Arc::default(),
            fallback_status: OperationStatus::assigning("op-1"),
            calls: Arc::default(),
        }
    }
}

impl FakeProvisioningClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Service that assigns every device to `hub` after `assigning_polls` polls.
    pub fn assigning_then(assigning_polls: usize, hub: &str) -> Self {
        let fake = Self::new();
        for _ in 0..assigning_polls {
            fake.push_status(OperationStatus::assigning("op-1"));
        }
        fake.push_status(OperationStatus::assigned(hub));
        fake
    }

    pub fn with_fallback_status(mut self, status: OperationStatus) -> Self {
        self.fallback_status = status;
        self
    }

    pub fn push_register(&self, response: OperationStatus) {
        self.register_script.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_register_error(&self, status: u16) {
        self.register_script.lock().unwrap().push_back(Err(status));
    }

    pub fn push_status(&self, response: OperationStatus) {
        self.status_script.lock().unwrap().push_back(Ok(response));
    }

    pub fn register_count(&self) -> usize {
        self.count(|c| matches!(c, ProvisioningCall::Register { .. }))
    }

    pub fn status_count(&self) -> usize {
        self.count(|c| matches!(c, ProvisioningCall::OperationStatus { .. }))
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn count(&self, pred: impl Fn(&ProvisioningCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }
}

fn scripted(
    next: Option<Result<OperationStatus, u16>>,
    fallback: &OperationStatus,
) -> Result<OperationStatus, ProvisioningError> {
    match next {
        Some(Ok(status)) => Ok(status),
        Some(Err(status)) => Err(ProvisioningError::Status {
            status,
            body: String::new(),
        }),
        None => Ok(fallback.clone()),
    }
}

#[async_trait]
impl ProvisioningClient for FakeProvisioningClient {
    async fn register(
        &self,
        scope_id: &str,
        registration: &DeviceRegistration,
        sas_token: &str,
    ) -> Result<OperationStatus, ProvisioningError> {
        self.calls.lock().unwrap().push(ProvisioningCall::Register {
            scope_id: scope_id.to_owned(),
            registration: registration.clone(),
            sas_token: sas_token.to_owned(),
        });
        let next = self.register_script.lock().unwrap().pop_front();
        scripted(next, &OperationStatus::assigning("op-1"))
    }

    async fn operation_status(
        &self,
        _scope_id: &str,
        device_id: &str,
        operation_id: &str,
        sas_token: &str,
    ) -> Result<OperationStatus, ProvisioningError> {
        self.calls.lock().unwrap().push(ProvisioningCall::OperationStatus {
            device_id: device_id.to_owned(),
            operation_id: operation_id.to_owned(),
            sas_token: sas_token.to_owned(),
        });
        let next = self.status_script.lock().unwrap().pop_front();
        scripted(next, &self.fallback_status)
    }
}
