//! Telemetry gateway service.
//!
//! Accepts JSON telemetry for devices that hold no credentials of their own,
//! derives each device's key from the fleet primary key, registers it with
//! the provisioning service on first contact, and forwards the measurements
//! to the hub the device was assigned to.
//!
//! # Configuration
//! Read from the environment (a `.env` file is honoured).
//!
//! | Env var                  | Default                                  |
//! |--------------------------|------------------------------------------|
//! | `GATEWAY_ADDR`           | `0.0.0.0:8080`                           |
//! | `ID_SCOPE`               | required                                 |
//! | `IOTC_KEY_URL`           | required                                 |
//! | `IOTC_PRIMARY_KEY`       | used when no managed identity is set     |
//! | `MSI_ENDPOINT`           | unset                                    |
//! | `MSI_SECRET`             | unset                                    |
//! | `DPS_HOST`               | `global.azure-devices-provisioning.net`  |
//! | `DPS_API_VERSION`        | `2018-11-01`                             |
//! | `DPS_POLL_ATTEMPTS`      | `10`                                     |
//! | `DPS_POLL_INTERVAL_MS`   | `2000`                                   |
//! | `DPS_POLL_BACKOFF_MS`    | unset (comma-separated, overrides fixed) |
//! | `DEVICE_ID_PATTERN`      | `^[a-zA-Z0-9\-._:]*[a-zA-Z0-9\-]+$`      |
//! | `IOTC_MODEL_ID`          | unset                                    |

use std::sync::Arc;

use anyhow::Result;
use device_identity::{DeviceProvisioner, HttpProvisioningClient, IdentityCache, VaultSecretsClient};
use telemetry_gateway::{
    config::PRIMARY_KEY_FALLBACK_VAR, router, AppState, Dispatcher, GatewayConfig,
    HttpHubTransport,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("telemetry_gateway=info".parse()?)
                .add_directive("device_identity=info".parse()?),
        )
        .json()
        .init();

    let config = GatewayConfig::from_env()?;
    info!(
        scope_id = %config.provisioning.scope_id,
        registration_host = %config.provisioning.registration_host,
        managed_identity = config.identity.is_some(),
        "gateway configured"
    );

    let client = HttpProvisioningClient::for_host(
        &config.provisioning.registration_host,
        &config.provisioning.api_version,
    );
    let secrets = VaultSecretsClient::new(config.identity.clone(), PRIMARY_KEY_FALLBACK_VAR);
    let provisioner = DeviceProvisioner::new(
        config.provisioning.clone(),
        Arc::new(client),
        Arc::new(secrets),
        config.primary_key_ref.clone(),
        Arc::new(IdentityCache::new()),
    );

    let state = Arc::new(AppState {
        dispatcher: Dispatcher::new(
            Arc::new(provisioner),
            Arc::new(HttpHubTransport::new()),
            config.device_ids.clone(),
        ),
    });

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "telemetry gateway listening");

    axum::serve(listener, app).await?;

    Ok(())
}
