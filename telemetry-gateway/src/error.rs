//! Gateway error type and its HTTP mapping.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use device_identity::{Classification, IdentityError};
use serde_json::json;
use thiserror::Error;

use crate::transport::DeliveryError;

/// Result type alias
pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Bad device id, payload or timestamp; never reaches the network.
    #[error("Invalid format: {0}")]
    Validation(String),

    /// Key derivation or registration failed.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("Unable to send telemetry for device {device_id}: {source}")]
    Delivery {
        device_id: String,
        #[source]
        source: DeliveryError,
    },
}

impl DispatchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        DispatchError::Validation(msg.into())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::Validation(_) => 400,
            DispatchError::Identity(e) => e.status_code(),
            DispatchError::Delivery { .. } => 500,
        }
    }

    pub fn classification(&self) -> Classification {
        Classification::from_status(self.status_code())
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retry_after = match &self {
            DispatchError::Identity(e) => e.retry_after_secs(),
            _ => None,
        };

        let mut response = (status, Json(json!({ "error": self.to_string() }))).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_classification() {
        assert_eq!(DispatchError::validation("bad").status_code(), 400);
        assert_eq!(
            DispatchError::validation("bad").classification(),
            Classification::ClientError
        );

        let cooldown = DispatchError::from(IdentityError::Cooldown {
            device_id: "sensor-001".into(),
            retry_after_secs: 30,
        });
        assert_eq!(cooldown.status_code(), 403);

        let delivery = DispatchError::Delivery {
            device_id: "sensor-001".into(),
            source: DeliveryError::Closed,
        };
        assert_eq!(delivery.status_code(), 500);
        assert_eq!(delivery.classification(), Classification::ServerError);
        assert!(delivery.to_string().contains("sensor-001"));
    }

    #[test]
    fn cooldown_response_carries_retry_after() {
        let response = DispatchError::from(IdentityError::Cooldown {
            device_id: "sensor-001".into(),
            retry_after_secs: 30,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "30");
    }
}
