//! Gateway configuration, resolved from environment variables.

use std::str::FromStr;
use std::time::Duration;

use device_identity::registration::{DEFAULT_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL};
use device_identity::secrets::IdentityEndpoint;
use device_identity::{DeviceIdPattern, PollPolicy, ProvisioningConfig};
use thiserror::Error;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Env var holding the primary key when no managed identity is configured.
pub const PRIMARY_KEY_FALLBACK_VAR: &str = "IOTC_PRIMARY_KEY";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub provisioning: ProvisioningConfig,
    /// Secret reference of the fleet primary key.
    pub primary_key_ref: String,
    /// Managed identity used to reach the secret store, if any.
    pub identity: Option<IdentityEndpoint>,
    pub device_ids: DeviceIdPattern,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| var(name).ok_or(ConfigError::Missing(name));

        let mut provisioning = ProvisioningConfig::new(required("ID_SCOPE")?);
        if let Some(host) = var("DPS_HOST") {
            provisioning.registration_host = host;
        }
        if let Some(version) = var("DPS_API_VERSION") {
            provisioning.api_version = version;
        }
        provisioning.model_id = var("IOTC_MODEL_ID");
        provisioning.poll_policy = match var("DPS_POLL_BACKOFF_MS") {
            Some(list) => PollPolicy::Backoff(parse_backoff(&list)?),
            None => PollPolicy::Fixed {
                attempts: parse_attempts(var("DPS_POLL_ATTEMPTS"))?,
                interval: parse_or(
                    "DPS_POLL_INTERVAL_MS",
                    var("DPS_POLL_INTERVAL_MS"),
                    DEFAULT_POLL_INTERVAL.as_millis() as u64,
                )
                .map(Duration::from_millis)?,
            },
        };

        let device_ids = match var("DEVICE_ID_PATTERN") {
            Some(pattern) => DeviceIdPattern::new(&pattern).map_err(|e| ConfigError::Invalid {
                var: "DEVICE_ID_PATTERN",
                reason: e.to_string(),
            })?,
            None => DeviceIdPattern::default(),
        };

        let identity = match (var("MSI_ENDPOINT"), var("MSI_SECRET")) {
            (Some(url), Some(secret)) => Some(IdentityEndpoint { url, secret }),
            _ => None,
        };

        Ok(Self {
            bind_addr: var("GATEWAY_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            provisioning,
            primary_key_ref: required("IOTC_KEY_URL")?,
            identity,
            device_ids,
        })
    }
}

fn parse_or<T: FromStr>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
    }
}

/// A zero budget would fail every registration before the first poll.
fn parse_attempts(raw: Option<String>) -> Result<usize, ConfigError> {
    match parse_or("DPS_POLL_ATTEMPTS", raw, DEFAULT_POLL_ATTEMPTS)? {
        0 => Err(ConfigError::Invalid {
            var: "DPS_POLL_ATTEMPTS",
            reason: "at least one poll is required".to_string(),
        }),
        attempts => Ok(attempts),
    }
}

/// Comma-separated millisecond delays, one per poll.
fn parse_backoff(list: &str) -> Result<Vec<Duration>, ConfigError> {
    let delays = list
        .split(',')
        .map(|ms| parse_or("DPS_POLL_BACKOFF_MS", Some(ms.to_string()), 0u64).map(Duration::from_millis))
        .collect::<Result<Vec<_>, _>>()?;
    if delays.is_empty() {
        return Err(ConfigError::Invalid {
            var: "DPS_POLL_BACKOFF_MS",
            reason: "no delays given".to_string(),
        });
    }
    Ok(delays)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<GatewayConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayConfig::from_lookup(|name| vars.get(name).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("ID_SCOPE", "0ne000ABC"),
        ("IOTC_KEY_URL", "https://vault.example.net/secrets/primary"),
    ];

    #[test]
    fn defaults_apply_when_only_required_vars_are_set() {
        let c = config(&REQUIRED).unwrap();
        assert_eq!(c.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(c.provisioning.scope_id, "0ne000ABC");
        assert_eq!(
            c.provisioning.registration_host,
            "global.azure-devices-provisioning.net"
        );
        assert_eq!(c.provisioning.api_version, "2018-11-01");
        assert_eq!(c.provisioning.poll_policy, PollPolicy::default());
        assert_eq!(c.provisioning.model_id, None);
        assert!(c.identity.is_none());
        assert!(c.device_ids.is_valid("sensor-001"));
    }

    #[test]
    fn missing_required_vars_are_reported() {
        assert_eq!(
            config(&[("IOTC_KEY_URL", "x")]).unwrap_err(),
            ConfigError::Missing("ID_SCOPE")
        );
        assert_eq!(
            config(&[("ID_SCOPE", "0ne000ABC"), ("IOTC_KEY_URL", "  ")]).unwrap_err(),
            ConfigError::Missing("IOTC_KEY_URL")
        );
    }

    #[test]
    fn overrides_are_applied() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("GATEWAY_ADDR", "127.0.0.1:9000"),
            ("DPS_HOST", "dps.example.net"),
            ("DPS_POLL_ATTEMPTS", "3"),
            ("DPS_POLL_INTERVAL_MS", "250"),
            ("DEVICE_ID_PATTERN", r"^[a-z0-9\-]+$"),
            ("IOTC_MODEL_ID", "urn:example:thermostat:1"),
            ("MSI_ENDPOINT", "http://127.0.0.1:41741/MSI/token"),
            ("MSI_SECRET", "s3cret"),
        ]);
        let c = config(&vars).unwrap();

        assert_eq!(c.bind_addr, "127.0.0.1:9000");
        assert_eq!(c.provisioning.registration_host, "dps.example.net");
        assert_eq!(
            c.provisioning.poll_policy,
            PollPolicy::Fixed {
                attempts: 3,
                interval: Duration::from_millis(250)
            }
        );
        assert_eq!(
            c.provisioning.model_id.as_deref(),
            Some("urn:example:thermostat:1")
        );
        assert!(!c.device_ids.is_valid("Sensor-001"));
        assert_eq!(c.identity.map(|i| i.secret).as_deref(), Some("s3cret"));
    }

    #[test]
    fn backoff_list_replaces_fixed_polling() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("DPS_POLL_BACKOFF_MS", "500, 1000,2000"));
        let c = config(&vars).unwrap();
        assert_eq!(
            c.provisioning.poll_policy,
            PollPolicy::Backoff(vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000),
            ])
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        for (var, value) in [
            ("DPS_POLL_ATTEMPTS", "ten"),
            ("DPS_POLL_ATTEMPTS", "0"),
            ("DPS_POLL_INTERVAL_MS", "-1"),
            ("DPS_POLL_BACKOFF_MS", "500,,1000"),
            ("DEVICE_ID_PATTERN", "[unclosed"),
        ] {
            let mut vars = REQUIRED.to_vec();
            vars.push((var, value));
            assert!(
                matches!(config(&vars), Err(ConfigError::Invalid { var: v, .. }) if v == var),
                "{var}={value}"
            );
        }
    }
}
