//! End-to-end registration flows through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    routing::{get, put},
    Json, Router,
};
use device_identity::provisioning::{FakeProvisioningClient, OperationStatus};
use device_identity::sas::SasToken;
use device_identity::secrets::StaticSecret;
use device_identity::{
    DeviceProvisioner, HttpProvisioningClient, IdentityCache, IdentityError, PollPolicy,
    ProvisioningConfig,
};

const PRIMARY: &str = "AAAAAAAAAAAAAAAAAAAAAA==";

#[derive(Default)]
struct DpsState {
    polls: AtomicUsize,
}

async fn register(Path((_scope, device)): Path<(String, String)>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "operationId": format!("op-{device}"), "status": "assigning" }))
}

async fn operation(
    State(state): State<Arc<DpsState>>,
    Path((_scope, _device, _operation)): Path<(String, String, String)>,
) -> Json<serde_json::Value> {
    // "assigning" once, then "assigned".
    if state.polls.fetch_add(1, Ordering::SeqCst) == 0 {
        return Json(serde_json::json!({ "status": "assigning" }));
    }
    Json(serde_json::json!({
        "status": "assigned",
        "registrationState": { "assignedHub": "hub1.example.net" }
    }))
}

async fn spawn_dps() -> (String, Arc<DpsState>) {
    let state = Arc::new(DpsState::default());
    let app = Router::new()
        .route("/:scope/registrations/:device/register", put(register))
        .route(
            "/:scope/registrations/:device/operations/:operation",
            get(operation),
        )
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (format!("http://{addr}"), state)
}

#[tokio::test]
async fn sensor_is_registered_over_http_and_cached() {
    let (base, dps) = spawn_dps().await;
    let mut config = ProvisioningConfig::new("0ne000ABC");
    config.poll_policy = PollPolicy::Fixed {
        attempts: 3,
        interval: Duration::from_millis(10),
    };
    let cache = Arc::new(IdentityCache::new());
    let provisioner = DeviceProvisioner::new(
        config,
        Arc::new(HttpProvisioningClient::new(&base, "2018-11-01")),
        Arc::new(StaticSecret::new(PRIMARY)),
        "primary-key",
        cache.clone(),
    );

    let connection = provisioner.connection_for("sensor-001").await.unwrap();

    assert_eq!(connection.host_name, "hub1.example.net");
    assert_eq!(connection.device_id, "sensor-001");
    let rendered = connection.to_string();
    assert!(rendered.contains("HostName=hub1.example.net"));
    assert!(rendered.contains("DeviceId=sensor-001"));
    assert_eq!(dps.polls.load(Ordering::SeqCst), 2);

    let entry = cache.get("sensor-001").unwrap();
    assert_eq!(entry.connection, Some(connection));
    assert_eq!(entry.assigned_hub.as_deref(), Some("hub1.example.net"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_first_requests_register_once() {
    let client = FakeProvisioningClient::assigning_then(2, "hub1.example.net");
    let provisioner = Arc::new(DeviceProvisioner::new(
        ProvisioningConfig::new("0ne000ABC"),
        Arc::new(client.clone()),
        Arc::new(StaticSecret::new(PRIMARY)),
        "primary-key",
        Arc::new(IdentityCache::new()),
    ));

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let p = provisioner.clone();
            tokio::spawn(async move { p.connection_for("sensor-001").await })
        })
        .collect();

    for handle in handles {
        let connection = handle.await.unwrap().unwrap();
        assert_eq!(connection.host_name, "hub1.example.net");
    }
    assert_eq!(client.register_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn blocked_device_then_rapid_retry_is_cooled_down() {
    let client = FakeProvisioningClient::new();
    client.push_status(OperationStatus::failed(400209));
    let provisioner = DeviceProvisioner::new(
        ProvisioningConfig::new("0ne000ABC"),
        Arc::new(client.clone()),
        Arc::new(StaticSecret::new(PRIMARY)),
        "primary-key",
        Arc::new(IdentityCache::new()),
    );

    let first = provisioner.connection_for("sensor-001").await.unwrap_err();
    assert!(matches!(first, IdentityError::Permission { .. }));

    let calls = client.total_calls();
    let second = provisioner.connection_for("sensor-001").await.unwrap_err();
    assert!(matches!(second, IdentityError::Cooldown { .. }));
    assert_eq!(client.total_calls(), calls);
    assert!(provisioner.cache().connection("sensor-001").is_none());
}

#[tokio::test(start_paused = true)]
async fn registration_token_signs_with_the_derived_key() {
    let client = FakeProvisioningClient::assigning_then(0, "hub1.example.net");
    let provisioner = DeviceProvisioner::new(
        ProvisioningConfig::new("0ne000ABC"),
        Arc::new(client.clone()),
        Arc::new(StaticSecret::new(PRIMARY)),
        "primary-key",
        Arc::new(IdentityCache::new()),
    );
    let connection = provisioner.connection_for("sensor-001").await.unwrap();

    let calls = client.calls.lock().unwrap().clone();
    let token = match &calls[0] {
        device_identity::provisioning::ProvisioningCall::Register { sas_token, .. } => {
            SasToken::parse(sas_token).unwrap()
        }
        other => panic!("unexpected call {other:?}"),
    };
    let resigned = SasToken::sign(
        &token.resource(),
        &connection.shared_access_key,
        token.key_name(),
        token.expiry(),
    )
    .unwrap();
    assert_eq!(resigned.signature(), token.signature());
}
