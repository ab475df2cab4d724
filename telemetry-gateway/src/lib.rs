//! HTTP front-end that forwards device telemetry to the hub each device is
//! assigned to, registering devices on first contact.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod models;
pub mod transport;

pub use config::{ConfigError, GatewayConfig};
pub use dispatcher::Dispatcher;
pub use error::DispatchError;
pub use handlers::{router, AppState};
pub use transport::{HttpHubTransport, TelemetryTransport};
