//! Device registration with the provisioning service.
//!
//! ```text
//! NotStarted ──cooldown ok──▶ Submitting ──assigning──▶ Polling ──assigned──▶ Assigned
//!      │                          │                     │  ▲ │
//!      └──cooldown───▶ Failed ◀───┴─────────────────────┘  └─┘ assigning (bounded)
//! ```
//!
//! Registration is asynchronous on the service side: the PUT only starts an
//! assignment operation, whose outcome is then polled a bounded number of
//! times. A per-device cooldown rejects repeated attempts locally so that a
//! misconfigured or unauthorised device cannot hammer the service.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::{IdentityCache, IdentityPatch};
use crate::error::{IdentityError, Result};
use crate::provisioning::{
    DeviceRegistration, OperationStatus, ProvisioningClient, ProvisioningError,
    RegistrationPayload,
};
use crate::sas;

pub const DEFAULT_REGISTRATION_HOST: &str = "global.azure-devices-provisioning.net";
pub const DEFAULT_API_VERSION: &str = "2018-11-01";
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_ATTEMPTS: usize = 10;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Error code the service reports for devices that are unassociated or blocked.
pub const DEVICE_BLOCKED_ERROR_CODE: i64 = 400209;

// ------------------------------------------------------------------ //
//  Configuration                                                      //
// ------------------------------------------------------------------ //

/// How often, and how many times, the operation status is polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollPolicy {
    /// `attempts` polls, each preceded by `interval`.
    Fixed { attempts: usize, interval: Duration },
    /// One poll after each delay, in order.
    Backoff(Vec<Duration>),
}

impl PollPolicy {
    /// Total number of status polls allowed.
    pub fn attempts(&self) -> usize {
        match self {
            PollPolicy::Fixed { attempts, .. } => *attempts,
            PollPolicy::Backoff(delays) => delays.len(),
        }
    }

    /// Delay before poll number `attempt` (zero based).
    pub fn delay(&self, attempt: usize) -> Option<Duration> {
        match self {
            PollPolicy::Fixed { attempts, interval } => (attempt < *attempts).then_some(*interval),
            PollPolicy::Backoff(delays) => delays.get(attempt).copied(),
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy::Fixed {
            attempts: DEFAULT_POLL_ATTEMPTS,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// Provisioning scope the fleet is enrolled in.
    pub scope_id: String,
    pub registration_host: String,
    pub api_version: String,
    /// Lifetime of registration SAS tokens.
    pub sas_ttl: Duration,
    /// Minimum time between registration attempts for one device.
    pub cooldown: Duration,
    pub poll_policy: PollPolicy,
    /// Model / template id sent with every registration.
    pub model_id: Option<String>,
}

impl ProvisioningConfig {
    pub fn new(scope_id: impl Into<String>) -> Self {
        Self {
            scope_id: scope_id.into(),
            registration_host: DEFAULT_REGISTRATION_HOST.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            sas_ttl: sas::DEFAULT_TTL,
            cooldown: DEFAULT_COOLDOWN,
            poll_policy: PollPolicy::default(),
            model_id: None,
        }
    }
}

// ------------------------------------------------------------------ //
//  State machine                                                      //
// ------------------------------------------------------------------ //

#[derive(Debug)]
pub enum RegistrationState {
    NotStarted,
    Submitting,
    Polling {
        operation_id: String,
        sas_token: String,
        attempt: usize,
    },
    Assigned { hub: String },
    Failed(IdentityError),
}

impl RegistrationState {
    fn name(&self) -> &'static str {
        match self {
            RegistrationState::NotStarted => "not_started",
            RegistrationState::Submitting => "submitting",
            RegistrationState::Polling { .. } => "polling",
            RegistrationState::Assigned { .. } => "assigned",
            RegistrationState::Failed(_) => "failed",
        }
    }
}

/// Drives device registrations against a [`ProvisioningClient`].
pub struct Registrar {
    config: ProvisioningConfig,
    client: Arc<dyn ProvisioningClient>,
    cache: Arc<IdentityCache>,
}

impl Registrar {
    pub fn new(
        config: ProvisioningConfig,
        client: Arc<dyn ProvisioningClient>,
        cache: Arc<IdentityCache>,
    ) -> Self {
        Self {
            config,
            client,
            cache,
        }
    }

    /// Register `device_id`, returning the hub it was assigned to.
    ///
    /// `device_key` is the device's derived key; a fresh registration token is
    /// signed with it for every call.
    pub async fn register_device(&self, device_id: &str, device_key: &str) -> Result<String> {
        self.register_with(device_id, || std::future::ready(Ok(device_key.to_owned())))
            .await
    }

    /// Like [`Registrar::register_device`], but the key is only requested
    /// once the cooldown has admitted the attempt.
    pub async fn register_with<F, Fut>(&self, device_id: &str, device_key: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let mut state = RegistrationState::NotStarted;
        let mut key_source = Some(device_key);
        let mut key = String::new();

        loop {
            let from = state.name();
            state = match state {
                RegistrationState::NotStarted => self.check_cooldown(device_id),
                RegistrationState::Submitting => match key_source.take() {
                    Some(source) => match source().await {
                        Ok(k) => {
                            key = k;
                            self.submit(device_id, &key).await
                        }
                        Err(e) => RegistrationState::Failed(e),
                    },
                    None => self.submit(device_id, &key).await,
                },
                RegistrationState::Polling {
                    operation_id,
                    sas_token,
                    attempt,
                } => self.poll(device_id, operation_id, sas_token, attempt).await,
                RegistrationState::Assigned { hub } => {
                    info!(device_id, hub = %hub, "device assigned");
                    self.cache.upsert(
                        device_id,
                        IdentityPatch {
                            assigned_hub: Some(hub.clone()),
                            ..Default::default()
                        },
                    );
                    return Ok(hub);
                }
                RegistrationState::Failed(err) => {
                    warn!(device_id, error = %err, "device registration failed");
                    return Err(err);
                }
            };
            debug!(device_id, from, to = state.name(), "registration transition");
        }
    }

    fn check_cooldown(&self, device_id: &str) -> RegistrationState {
        match self
            .cache
            .begin_registration_attempt(device_id, self.config.cooldown)
        {
            Ok(()) => RegistrationState::Submitting,
            Err(remaining) => RegistrationState::Failed(IdentityError::Cooldown {
                device_id: device_id.to_owned(),
                retry_after_secs: remaining.as_secs(),
            }),
        }
    }

    async fn submit(&self, device_id: &str, device_key: &str) -> RegistrationState {
        let token = match sas::registration_token(
            &self.config.scope_id,
            device_id,
            device_key,
            self.config.sas_ttl,
        ) {
            Ok(token) => token.to_string(),
            Err(e) => {
                return RegistrationState::Failed(IdentityError::Protocol {
                    device_id: device_id.to_owned(),
                    detail: format!("unable to sign registration token: {e}"),
                })
            }
        };

        let registration = DeviceRegistration {
            registration_id: device_id.to_owned(),
            payload: self.config.model_id.as_ref().map(|model_id| RegistrationPayload {
                model_id: model_id.clone(),
            }),
        };

        info!(device_id, "initiating device registration");
        let response = match self
            .client
            .register(&self.config.scope_id, &registration, &token)
            .await
        {
            Ok(response) => response,
            Err(e) => return RegistrationState::Failed(upstream(device_id, e)),
        };

        let assigning = response.status() == Some("assigning");
        match response.operation_id {
            Some(operation_id) if assigning && !operation_id.is_empty() => {
                RegistrationState::Polling {
                    operation_id,
                    sas_token: token,
                    attempt: 0,
                }
            }
            _ => RegistrationState::Failed(unknown_response(device_id)),
        }
    }

    async fn poll(
        &self,
        device_id: &str,
        operation_id: String,
        sas_token: String,
        attempt: usize,
    ) -> RegistrationState {
        let Some(delay) = self.config.poll_policy.delay(attempt) else {
            return RegistrationState::Failed(IdentityError::RetryBudgetExceeded {
                device_id: device_id.to_owned(),
                attempts: attempt,
            });
        };
        tokio::time::sleep(delay).await;

        debug!(device_id, attempt = attempt + 1, "querying device registration status");
        let response = match self
            .client
            .operation_status(&self.config.scope_id, device_id, &operation_id, &sas_token)
            .await
        {
            Ok(response) => response,
            Err(e) => return RegistrationState::Failed(upstream(device_id, e)),
        };

        classify_status(device_id, &response).unwrap_or(RegistrationState::Polling {
            operation_id,
            sas_token,
            attempt: attempt + 1,
        })
    }
}

/// Terminal state for a polled status, or `None` to keep polling.
fn classify_status(device_id: &str, response: &OperationStatus) -> Option<RegistrationState> {
    match response.status() {
        Some("assigning") => None,
        Some("assigned") => Some(match response.assigned_hub() {
            Some(hub) => RegistrationState::Assigned {
                hub: hub.to_owned(),
            },
            None => RegistrationState::Failed(unknown_response(device_id)),
        }),
        Some("failed") if response.error_code() == Some(DEVICE_BLOCKED_ERROR_CODE) => {
            Some(RegistrationState::Failed(IdentityError::Permission {
                device_id: device_id.to_owned(),
            }))
        }
        _ => Some(RegistrationState::Failed(unknown_response(device_id))),
    }
}

fn unknown_response(device_id: &str) -> IdentityError {
    IdentityError::Protocol {
        device_id: device_id.to_owned(),
        detail: "Unknown server response".to_string(),
    }
}

fn upstream(device_id: &str, err: ProvisioningError) -> IdentityError {
    IdentityError::Upstream {
        device_id: device_id.to_owned(),
        status: err.status(),
        message: err.to_string(),
    }
}
