//! Device connection descriptors.
//!
//! A descriptor is the credential a telemetry session is opened with:
//! `HostName={hub};DeviceId={device id};SharedAccessKey={device key}`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("connection descriptor is missing '{0}'")]
    MissingField(&'static str),
    #[error("connection descriptor segment '{0}' is not a key=value pair")]
    MalformedSegment(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host_name: String,
    pub device_id: String,
    pub shared_access_key: String,
}

impl ConnectionDescriptor {
    pub fn new(
        host_name: impl Into<String>,
        device_id: impl Into<String>,
        shared_access_key: impl Into<String>,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            device_id: device_id.into(),
            shared_access_key: shared_access_key.into(),
        }
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HostName={};DeviceId={};SharedAccessKey={}",
            self.host_name, self.device_id, self.shared_access_key
        )
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut device_id = None;
        let mut shared_access_key = None;

        for segment in s.split(';').filter(|seg| !seg.is_empty()) {
            // Base64 keys end in '=', so split on the first '=' only.
            let (name, value) = segment
                .split_once('=')
                .ok_or_else(|| DescriptorError::MalformedSegment(segment.to_owned()))?;
            match name {
                "HostName" => host_name = Some(value.to_owned()),
                "DeviceId" => device_id = Some(value.to_owned()),
                "SharedAccessKey" => shared_access_key = Some(value.to_owned()),
                _ => {}
            }
        }

        Ok(Self {
            host_name: host_name
                .filter(|v| !v.is_empty())
                .ok_or(DescriptorError::MissingField("HostName"))?,
            device_id: device_id
                .filter(|v| !v.is_empty())
                .ok_or(DescriptorError::MissingField("DeviceId"))?,
            shared_access_key: shared_access_key
                .filter(|v| !v.is_empty())
                .ok_or(DescriptorError::MissingField("SharedAccessKey"))?,
        })
    }
}
