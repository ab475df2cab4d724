//! Telemetry dispatch: validate, resolve a connection, deliver.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use device_identity::{DeviceIdPattern, DeviceProvisioner};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{DispatchError, Result};
use crate::models::{DeviceSpec, Measurements, TelemetryRequest};
use crate::transport::{TelemetryMessage, TelemetryTransport, CREATION_TIME_PROPERTY};

const INVALID_DEVICE_ID: &str = "deviceId must be alphanumeric and may contain '-', '.', '_', ':'. \
     Last character must be alphanumeric or hyphen.";

/// Validated form of a [`TelemetryRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Target devices in input order.
    pub device_ids: Vec<String>,
    /// Measurements exactly as received; this is what gets sent.
    pub payload: Value,
    pub measurements: Measurements,
    /// Normalised RFC 3339 creation time, if one was supplied.
    pub creation_time: Option<String>,
}

pub struct Dispatcher {
    provisioner: Arc<DeviceProvisioner>,
    transport: Arc<dyn TelemetryTransport>,
    device_ids: DeviceIdPattern,
}

impl Dispatcher {
    pub fn new(
        provisioner: Arc<DeviceProvisioner>,
        transport: Arc<dyn TelemetryTransport>,
        device_ids: DeviceIdPattern,
    ) -> Self {
        Self {
            provisioner,
            transport,
            device_ids,
        }
    }

    pub fn provisioner(&self) -> &Arc<DeviceProvisioner> {
        &self.provisioner
    }

    /// Check a request without touching the network.
    pub fn validate(&self, request: TelemetryRequest) -> Result<Envelope> {
        let specs: Vec<DeviceSpec> = match (request.device, request.devices) {
            (Some(device), None) => vec![device],
            (None, Some(devices)) if !devices.is_empty() => devices,
            (None, Some(_)) => {
                return Err(DispatchError::validation("the device list must not be empty."))
            }
            (Some(_), Some(_)) => {
                return Err(DispatchError::validation(
                    "provide either 'device' or 'devices', not both.",
                ))
            }
            (None, None) => {
                return Err(DispatchError::validation(
                    "a device specification must be provided.",
                ))
            }
        };

        let device_ids = specs
            .into_iter()
            .map(|spec| match spec.device_id {
                Some(id) if self.device_ids.is_valid(&id) => Ok(id),
                _ => Err(DispatchError::validation(INVALID_DEVICE_ID)),
            })
            .collect::<Result<Vec<_>>>()?;

        let payload = request
            .measurements
            .ok_or_else(|| DispatchError::validation("invalid measurement list."))?;
        let measurements =
            Measurements::try_from(&payload).map_err(|e| DispatchError::validation(e.to_string()))?;

        let creation_time = request
            .timestamp
            .map(|ts| {
                DateTime::parse_from_rfc3339(&ts)
                    .map(|t| t.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true))
                    .map_err(|_| {
                        DispatchError::validation(
                            "if present, timestamp must be in ISO format (e.g., YYYY-MM-DDTHH:mm:ss.sssZ)",
                        )
                    })
            })
            .transpose()?;

        Ok(Envelope {
            device_ids,
            payload,
            measurements,
            creation_time,
        })
    }

    /// Deliver the request's measurements for every target device.
    ///
    /// Devices are handled in input order and the first failure stops the
    /// batch; earlier deliveries stand. Returns the number of devices served.
    pub async fn send(&self, request: TelemetryRequest) -> Result<usize> {
        let envelope = self.validate(request)?;
        let body = envelope.payload.to_string();

        for device_id in &envelope.device_ids {
            let mut message = TelemetryMessage::json(body.clone());
            if let Some(ts) = &envelope.creation_time {
                message = message.with_property(CREATION_TIME_PROPERTY, ts.clone());
            }
            self.deliver(device_id, &message).await?;
        }

        info!(
            devices = envelope.device_ids.len(),
            fields = envelope.measurements.len(),
            "telemetry delivered"
        );
        Ok(envelope.device_ids.len())
    }

    async fn deliver(&self, device_id: &str, message: &TelemetryMessage) -> Result<()> {
        let connection = self.provisioner.connection_for(device_id).await?;
        let delivery_failed = |source| DispatchError::Delivery {
            device_id: device_id.to_owned(),
            source,
        };

        let mut session = self
            .transport
            .open(&connection)
            .await
            .map_err(delivery_failed)?;

        if let Err(e) = session.send(message).await {
            if e.is_identity_not_found() {
                // Hub forgot the device; the key is unchanged, the assignment is not.
                self.provisioner.invalidate(device_id);
                warn!(device_id, hub = %connection.host_name, "device unknown to hub, cached connection dropped");
            }
            // Best effort; the send error is what the caller needs.
            let _ = session.close().await;
            return Err(delivery_failed(e));
        }

        session.close().await.map_err(delivery_failed)
    }
}
