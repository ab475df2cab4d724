//! HTTP request/response models for the gateway's public API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

// ------------------------------------------------------------------ //
//  Inbound (device integration → gateway)                             //
// ------------------------------------------------------------------ //

/// A device the telemetry is sent on behalf of.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceSpec {
    #[serde(rename = "deviceId", default)]
    pub device_id: Option<String>,
}

impl DeviceSpec {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
        }
    }
}

/// Request body accepted by `POST /telemetry`.
///
/// Exactly one of `device` or `devices` must be present.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelemetryRequest {
    pub device: Option<DeviceSpec>,
    pub devices: Option<Vec<DeviceSpec>>,
    /// Map of field name to measurement value; validated into [`Measurements`].
    pub measurements: Option<Value>,
    /// ISO-8601 creation time of the readings.
    pub timestamp: Option<String>,
}

// ------------------------------------------------------------------ //
//  Measurements                                                       //
// ------------------------------------------------------------------ //

/// A geographic position reported as a measurement value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
}

/// A single measurement value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Measurement {
    /// Kept as received, so integers stay integers.
    Number(Number),
    Text(String),
    Location(Location),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MeasurementError {
    #[error("measurements must be a non-null object")]
    NotAnObject,
    #[error("measurement '{0}' must be a number, a string, or a location")]
    UnsupportedValue(String),
    #[error("measurement '{field}' is not a valid location: {reason}")]
    InvalidLocation { field: String, reason: &'static str },
}

/// Validated measurement payload, serialised as a plain JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Measurements(pub BTreeMap<String, Measurement>);

impl Measurements {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&Measurement> {
        self.0.get(field)
    }
}

impl TryFrom<&Value> for Measurements {
    type Error = MeasurementError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        let object = value.as_object().ok_or(MeasurementError::NotAnObject)?;
        object
            .iter()
            .map(|(field, v)| Ok((field.clone(), parse_measurement(field, v)?)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Measurements)
    }
}

fn parse_measurement(field: &str, value: &Value) -> Result<Measurement, MeasurementError> {
    match value {
        Value::Number(n) => Ok(Measurement::Number(n.clone())),
        Value::String(s) => Ok(Measurement::Text(s.clone())),
        Value::Object(obj) => parse_location(field, obj).map(Measurement::Location),
        _ => Err(MeasurementError::UnsupportedValue(field.to_owned())),
    }
}

fn parse_location(
    field: &str,
    obj: &serde_json::Map<String, Value>,
) -> Result<Location, MeasurementError> {
    let invalid = |reason| MeasurementError::InvalidLocation {
        field: field.to_owned(),
        reason,
    };

    if obj.keys().any(|k| !matches!(k.as_str(), "lat" | "lon" | "alt")) {
        return Err(invalid("only 'lat', 'lon' and 'alt' are allowed"));
    }

    let lat = obj
        .get("lat")
        .ok_or_else(|| invalid("'lat' is required"))?
        .as_f64()
        .ok_or_else(|| invalid("'lat' must be a number"))?;
    let lon = obj
        .get("lon")
        .ok_or_else(|| invalid("'lon' is required"))?
        .as_f64()
        .ok_or_else(|| invalid("'lon' must be a number"))?;
    let alt = match obj.get("alt") {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.as_f64().ok_or_else(|| invalid("'alt' must be a number"))?),
    };

    Ok(Location { lat, lon, alt })
}

// ------------------------------------------------------------------ //
//  Outbound (gateway → caller)                                        //
// ------------------------------------------------------------------ //

/// Successful response for `POST /telemetry`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelemetryResponse {
    /// Number of devices the telemetry was delivered for.
    pub delivered: usize,
}
