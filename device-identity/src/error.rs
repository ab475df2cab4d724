//! Identity engine errors.

use thiserror::Error;

use crate::keys::KeyError;
use crate::secrets::SecretError;

/// Result type for identity operations.
pub type Result<T> = std::result::Result<T, IdentityError>;

/// Whether a failure is the caller's fault or ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    ClientError,
    ServerError,
}

impl Classification {
    pub fn from_status(status: u16) -> Self {
        if (400..500).contains(&status) {
            Classification::ClientError
        } else {
            Classification::ServerError
        }
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Unable to derive key for device {device_id}: {source}")]
    Secret {
        device_id: String,
        #[source]
        source: SecretError,
    },

    #[error("Unable to derive key for device {device_id}: primary key is invalid ({source})")]
    InvalidPrimaryKey {
        device_id: String,
        #[source]
        source: KeyError,
    },

    #[error(
        "Unable to register device {device_id}. Minimum registration timeout not yet exceeded. \
         Please try again in {retry_after_secs} seconds"
    )]
    Cooldown {
        device_id: String,
        retry_after_secs: u64,
    },

    #[error("Unable to register device {device_id}: The device may be unassociated or blocked")]
    Permission { device_id: String },

    #[error("Unable to register device {device_id}: {detail}")]
    Protocol { device_id: String, detail: String },

    #[error(
        "Unable to register device {device_id}: Registration was not successful after {attempts} status queries"
    )]
    RetryBudgetExceeded { device_id: String, attempts: usize },

    #[error("Unable to register device {device_id}: {message}")]
    Upstream {
        device_id: String,
        status: Option<u16>,
        message: String,
    },
}

impl IdentityError {
    pub fn device_id(&self) -> &str {
        match self {
            IdentityError::Secret { device_id, .. }
            | IdentityError::InvalidPrimaryKey { device_id, .. }
            | IdentityError::Cooldown { device_id, .. }
            | IdentityError::Permission { device_id }
            | IdentityError::Protocol { device_id, .. }
            | IdentityError::RetryBudgetExceeded { device_id, .. }
            | IdentityError::Upstream { device_id, .. } => device_id,
        }
    }

    /// HTTP-style status for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            IdentityError::Cooldown { .. } | IdentityError::Permission { .. } => 403,
            IdentityError::Upstream {
                status: Some(status),
                ..
            } if (400..600).contains(status) => *status,
            _ => 500,
        }
    }

    pub fn classification(&self) -> Classification {
        Classification::from_status(self.status_code())
    }

    /// Seconds the caller should wait before retrying, when known.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            IdentityError::Cooldown {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }
}
