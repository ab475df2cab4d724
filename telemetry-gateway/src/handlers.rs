//! Axum HTTP handlers for the telemetry gateway.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    dispatcher::Dispatcher,
    error::DispatchError,
    models::{TelemetryRequest, TelemetryResponse},
};

/// Shared state injected into every Axum handler via `State`.
pub struct AppState {
    pub dispatcher: Dispatcher,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/telemetry", post(post_telemetry))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ------------------------------------------------------------------ //
//  POST /telemetry                                                    //
// ------------------------------------------------------------------ //

/// Send one measurement payload on behalf of a device or a batch of devices.
pub async fn post_telemetry(
    State(state): State<Arc<AppState>>,
    body: Result<Json<TelemetryRequest>, JsonRejection>,
) -> Result<Json<TelemetryResponse>, DispatchError> {
    // Shape errors get the same 400 `{"error": ..}` answer as other bad input.
    let result = match body {
        Ok(Json(req)) => state.dispatcher.send(req).await,
        Err(rejection) => Err(DispatchError::validation(rejection.body_text())),
    };
    match result {
        Ok(delivered) => {
            info!(delivered, "POST /telemetry processed");
            Ok(Json(TelemetryResponse { delivered }))
        }
        Err(e) => {
            error!(status = e.status_code(), error = %e, "POST /telemetry failed");
            Err(e)
        }
    }
}

// ------------------------------------------------------------------ //
//  GET /health                                                        //
// ------------------------------------------------------------------ //

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FakeTransport;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use device_identity::provisioning::{FakeProvisioningClient, OperationStatus};
    use device_identity::secrets::StaticSecret;
    use device_identity::{DeviceIdPattern, DeviceProvisioner, IdentityCache, ProvisioningConfig};
    use tower::ServiceExt;

    fn app(client: &FakeProvisioningClient, transport: &FakeTransport) -> Router {
        let provisioner = DeviceProvisioner::new(
            ProvisioningConfig::new("0ne000ABC"),
            Arc::new(client.clone()),
            Arc::new(StaticSecret::new("AAAAAAAAAAAAAAAAAAAAAA==")),
            "primary-key",
            Arc::new(IdentityCache::new()),
        );
        router(Arc::new(AppState {
            dispatcher: Dispatcher::new(
                Arc::new(provisioner),
                Arc::new(transport.clone()),
                DeviceIdPattern::default(),
            ),
        }))
    }

    fn post(body: serde_json::Value) -> Request<Body> {
        Request::post("/telemetry")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = app(&FakeProvisioningClient::new(), &FakeTransport::new())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_is_accepted() {
        let client = FakeProvisioningClient::new()
            .with_fallback_status(OperationStatus::assigned("hub1.example.net"));
        let transport = FakeTransport::new();

        let response = app(&client, &transport)
            .oneshot(post(serde_json::json!({
                "devices": [{ "deviceId": "sensor-001" }, { "deviceId": "sensor-002" }],
                "measurements": { "temperature": 21.5 }
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!({ "delivered": 2 }));
        assert_eq!(transport.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn invalid_device_id_is_a_bad_request() {
        let client = FakeProvisioningClient::new();
        let response = app(&client, &FakeTransport::new())
            .oneshot(post(serde_json::json!({
                "device": { "deviceId": "bad id" },
                "measurements": { "temperature": 21.5 }
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("Invalid format"));
        assert_eq!(client.total_calls(), 0);
    }

    #[tokio::test]
    async fn malformed_bodies_are_bad_requests() {
        let client = FakeProvisioningClient::new();
        let transport = FakeTransport::new();

        let mut requests: Vec<Request<Body>> = [
            serde_json::json!({ "device": { "deviceId": 5 }, "measurements": {} }),
            serde_json::json!({ "devices": [null], "measurements": {} }),
            serde_json::json!({ "device": "sensor-001", "measurements": {} }),
        ]
        .into_iter()
        .map(post)
        .collect();
        requests.push(
            Request::post("/telemetry")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{\"device\":"))
                .unwrap(),
        );
        requests.push(
            Request::post("/telemetry")
                .body(Body::from("{}"))
                .unwrap(),
        );

        for request in requests {
            let response = app(&client, &transport).oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = json_body(response).await;
            assert!(body["error"].as_str().unwrap().starts_with("Invalid format: "));
        }
        assert_eq!(client.total_calls(), 0);
        assert_eq!(transport.opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_device_is_forbidden() {
        let client = FakeProvisioningClient::new();
        client.push_status(OperationStatus::failed(400209));

        let response = app(&client, &FakeTransport::new())
            .oneshot(post(serde_json::json!({
                "device": { "deviceId": "sensor-001" },
                "measurements": { "temperature": 21.5 }
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = json_body(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("The device may be unassociated or blocked"));
    }
}
