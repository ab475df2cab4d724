//! Device identity and registration engine.
//!
//! Devices hold no pre-provisioned credential. Given the fleet primary key
//! (fetched through a [`SecretSupplier`]) and a device id, this crate derives
//! the device key, registers the device with the provisioning service, and
//! caches the resulting connection descriptor for the telemetry path.
//!
//! ```text
//! DeviceProvisioner ─▶ IdentityCache ─(miss)─▶ Registrar ─▶ sas ─▶ keys
//!                                                 │
//!                                                 ▼
//!                                        ProvisioningClient (HTTP)
//! ```

pub mod cache;
pub mod connection;
pub mod device_id;
pub mod error;
pub mod keys;
pub mod provisioner;
pub mod provisioning;
pub mod registration;
pub mod sas;
pub mod secrets;

pub use cache::{DeviceIdentity, IdentityCache, IdentityPatch};
pub use connection::ConnectionDescriptor;
pub use device_id::DeviceIdPattern;
pub use error::{Classification, IdentityError};
pub use provisioner::DeviceProvisioner;
pub use provisioning::{HttpProvisioningClient, ProvisioningClient};
pub use registration::{PollPolicy, ProvisioningConfig, Registrar};
pub use secrets::{SecretSupplier, VaultSecretsClient};
