//! In-memory device identity cache.
//!
//! One [`DeviceIdentity`] per device id, upserted in place. Entries are never
//! evicted, so memory grows with the number of distinct device ids seen by the
//! process. Nothing is persisted across restarts, and nothing is shared between
//! process instances: the registration cooldown holds per process only.
//!
//! Each device id also owns an async registration guard. Callers resolving a
//! connection for the same device serialise on it, so a burst of first requests
//! for one device triggers a single registration.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::connection::ConnectionDescriptor;

/// Cached identity state for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    /// Base64 device key; once set it never changes.
    pub derived_key: Option<String>,
    /// Hub assigned by the last successful registration.
    pub assigned_hub: Option<String>,
    /// Only ever set from a registration that reached the assigned state.
    pub connection: Option<ConnectionDescriptor>,
    pub last_registration_attempt: Option<Instant>,
}

impl DeviceIdentity {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_owned(),
            derived_key: None,
            assigned_hub: None,
            connection: None,
            last_registration_attempt: None,
        }
    }
}

/// Fields to overwrite on upsert; `None` leaves the cached value untouched.
#[derive(Debug, Clone, Default)]
pub struct IdentityPatch {
    pub derived_key: Option<String>,
    pub assigned_hub: Option<String>,
    pub connection: Option<ConnectionDescriptor>,
    pub last_registration_attempt: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct IdentityCache {
    entries: DashMap<String, DeviceIdentity>,
    guards: DashMap<String, Arc<Mutex<()>>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the cached identity for `device_id`.
    pub fn get(&self, device_id: &str) -> Option<DeviceIdentity> {
        self.entries.get(device_id).map(|e| e.value().clone())
    }

    /// Cached connection descriptor, if the device has a live one.
    pub fn connection(&self, device_id: &str) -> Option<ConnectionDescriptor> {
        self.entries
            .get(device_id)
            .and_then(|e| e.connection.clone())
    }

    pub fn derived_key(&self, device_id: &str) -> Option<String> {
        self.entries
            .get(device_id)
            .and_then(|e| e.derived_key.clone())
    }

    /// Create or update the entry for `device_id`.
    pub fn upsert(&self, device_id: &str, patch: IdentityPatch) {
        let mut entry = self
            .entries
            .entry(device_id.to_owned())
            .or_insert_with(|| DeviceIdentity::new(device_id));

        if let Some(key) = patch.derived_key {
            entry.derived_key = Some(key);
        }
        if let Some(hub) = patch.assigned_hub {
            entry.assigned_hub = Some(hub);
        }
        if let Some(connection) = patch.connection {
            entry.connection = Some(connection);
        }
        if let Some(at) = patch.last_registration_attempt {
            entry.last_registration_attempt = Some(at);
        }
    }

    /// Drop the cached connection descriptor, keeping every other field.
    ///
    /// Returns `true` if a descriptor was cleared.
    pub fn invalidate_connection(&self, device_id: &str) -> bool {
        match self.entries.get_mut(device_id) {
            Some(mut entry) => {
                let cleared = entry.connection.take().is_some();
                if cleared {
                    debug!(device_id, "cached connection invalidated");
                }
                cleared
            }
            None => false,
        }
    }

    /// Atomically apply the registration cooldown for `device_id`.
    ///
    /// If the previous attempt is older than `cooldown` (or there is none) the
    /// attempt is recorded as happening now and `Ok` is returned. Otherwise the
    /// recorded time is left as is and the remaining cooldown is returned.
    pub fn begin_registration_attempt(
        &self,
        device_id: &str,
        cooldown: Duration,
    ) -> Result<(), Duration> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(device_id.to_owned())
            .or_insert_with(|| DeviceIdentity::new(device_id));

        if let Some(last) = entry.last_registration_attempt {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < cooldown {
                return Err(cooldown - elapsed);
            }
        }

        entry.last_registration_attempt = Some(now);
        Ok(())
    }

    /// The registration guard for `device_id`.
    pub fn registration_guard(&self, device_id: &str) -> Arc<Mutex<()>> {
        self.guards
            .entry(device_id.to_owned())
            .or_default()
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
