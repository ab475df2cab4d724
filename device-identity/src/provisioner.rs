//! Connection resolution for devices.
//!
//! [`DeviceProvisioner`] turns a device id into a [`ConnectionDescriptor`],
//! deriving the device key and registering the device on a cache miss.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::{IdentityCache, IdentityPatch};
use crate::connection::ConnectionDescriptor;
use crate::error::{IdentityError, Result};
use crate::keys::derive_device_key;
use crate::provisioning::ProvisioningClient;
use crate::registration::{ProvisioningConfig, Registrar};
use crate::secrets::SecretSupplier;

pub struct DeviceProvisioner {
    registrar: Registrar,
    secrets: Arc<dyn SecretSupplier>,
    /// Secret reference of the fleet primary key.
    primary_key_ref: String,
    cache: Arc<IdentityCache>,
}

impl DeviceProvisioner {
    pub fn new(
        config: ProvisioningConfig,
        client: Arc<dyn ProvisioningClient>,
        secrets: Arc<dyn SecretSupplier>,
        primary_key_ref: impl Into<String>,
        cache: Arc<IdentityCache>,
    ) -> Self {
        Self {
            registrar: Registrar::new(config, client, cache.clone()),
            secrets,
            primary_key_ref: primary_key_ref.into(),
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    /// The connection descriptor for `device_id`, registering it if needed.
    ///
    /// Concurrent calls for the same device wait for each other, so only the
    /// first one reaches the provisioning service.
    pub async fn connection_for(&self, device_id: &str) -> Result<ConnectionDescriptor> {
        let guard = self.cache.registration_guard(device_id);
        let _held = guard.lock().await;

        if let Some(connection) = self.cache.connection(device_id) {
            debug!(device_id, "using cached connection");
            return Ok(connection);
        }

        // The cooldown is applied before the secret store is consulted.
        let hub = self
            .registrar
            .register_with(device_id, || self.device_key(device_id))
            .await?;
        let device_key = self.device_key(device_id).await?;

        let connection = ConnectionDescriptor::new(hub, device_id, device_key);
        self.cache.upsert(
            device_id,
            IdentityPatch {
                connection: Some(connection.clone()),
                ..Default::default()
            },
        );
        info!(device_id, hub = %connection.host_name, "device connection resolved");
        Ok(connection)
    }

    /// The derived key for `device_id`, computed once and then cached.
    pub async fn device_key(&self, device_id: &str) -> Result<String> {
        if let Some(key) = self.cache.derived_key(device_id) {
            return Ok(key);
        }

        let primary_key = self
            .secrets
            .get_secret(&self.primary_key_ref, false)
            .await
            .map_err(|source| IdentityError::Secret {
                device_id: device_id.to_owned(),
                source,
            })?;

        let key = derive_device_key(&primary_key, device_id).map_err(|source| {
            IdentityError::InvalidPrimaryKey {
                device_id: device_id.to_owned(),
                source,
            }
        })?;

        self.cache.upsert(
            device_id,
            IdentityPatch {
                derived_key: Some(key.clone()),
                ..Default::default()
            },
        );
        Ok(key)
    }

    /// Forget the cached connection for `device_id`; its key is kept.
    pub fn invalidate(&self, device_id: &str) -> bool {
        self.cache.invalidate_connection(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::FakeProvisioningClient;
    use crate::secrets::StaticSecret;

    const PRIMARY: &str = "AAAAAAAAAAAAAAAAAAAAAA==";

    fn provisioner(client: &FakeProvisioningClient, secret: &StaticSecret) -> DeviceProvisioner {
        DeviceProvisioner::new(
            ProvisioningConfig::new("0ne000ABC"),
            Arc::new(client.clone()),
            Arc::new(secret.clone()),
            "https://vault.example.net/secrets/primary",
            Arc::new(IdentityCache::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn cache_hit_skips_registration() {
        let client = FakeProvisioningClient::assigning_then(0, "hub1.example.net");
        let secret = StaticSecret::new(PRIMARY);
        let p = provisioner(&client, &secret);

        let first = p.connection_for("sensor-001").await.unwrap();
        let second = p.connection_for("sensor-001").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(client.register_count(), 1);
        assert_eq!(secret.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn derived_key_is_computed_once() {
        let client = FakeProvisioningClient::new();
        let secret = StaticSecret::new(PRIMARY);
        let p = provisioner(&client, &secret);

        let k1 = p.device_key("sensor-001").await.unwrap();
        let k2 = p.device_key("sensor-001").await.unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1, derive_device_key(PRIMARY, "sensor-001").unwrap());
        assert_eq!(secret.fetch_count(), 1);
        assert_eq!(client.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_primary_key_is_reported_with_device() {
        let client = FakeProvisioningClient::new();
        let p = provisioner(&client, &StaticSecret::new("%%%"));

        let err = p.connection_for("sensor-001").await.unwrap_err();
        assert!(matches!(err, IdentityError::InvalidPrimaryKey { .. }));
        assert_eq!(err.device_id(), "sensor-001");
        assert_eq!(client.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_key_lookup_is_cooled_down_too() {
        let client = FakeProvisioningClient::new();
        let secret = StaticSecret::new("%%%");
        let p = provisioner(&client, &secret);

        let first = p.connection_for("sensor-001").await.unwrap_err();
        assert!(matches!(first, IdentityError::InvalidPrimaryKey { .. }));
        assert_eq!(secret.fetch_count(), 1);

        let second = p.connection_for("sensor-001").await.unwrap_err();
        assert!(matches!(second, IdentityError::Cooldown { .. }));
        assert_eq!(secret.fetch_count(), 1);
        assert_eq!(client.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_keeps_key_and_forces_reregistration() {
        let client = FakeProvisioningClient::assigning_then(0, "hub1.example.net");
        let secret = StaticSecret::new(PRIMARY);
        let p = provisioner(&client, &secret);

        p.connection_for("sensor-001").await.unwrap();
        assert!(p.invalidate("sensor-001"));
        let entry = p.cache().get("sensor-001").unwrap();
        assert_eq!(entry.connection, None);
        assert!(entry.derived_key.is_some());

        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        client.push_status(crate::provisioning::OperationStatus::assigned("hub2.example.net"));
        let again = p.connection_for("sensor-001").await.unwrap();

        assert_eq!(again.host_name, "hub2.example.net");
        assert_eq!(client.register_count(), 2);
        assert_eq!(secret.fetch_count(), 1);
    }
}
