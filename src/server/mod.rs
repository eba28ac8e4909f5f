//! HTTP and WebSocket server
//!
//! Wires the management API (device status + user-side connect) and the
//! internal API (device-side connect, health) onto an axum router. The
//! endpoint handlers receive their collaborators (store, bus, RBAC
//! allow-check) as injected capabilities; tests supply fakes.

pub mod conn;
pub mod device;
pub mod management;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::RemoteTerminalAccess;
use crate::bus::MessageBus;
use crate::config::Config;
use crate::store::{DataStore, StoreError};

use device::DeviceConnections;

/// Base path of the management API.
pub const API_MANAGEMENT: &str = "/api/management/v1/deviceconnect";
/// Base path of the internal (device-facing) API.
pub const API_INTERNAL: &str = "/api/internal/v1/deviceconnect";

/// Connection and bridging counters, updated with atomic operations and
/// logged when connections close.
#[derive(Debug, Default)]
pub struct Telemetry {
    /// Keep-alive pings written to sockets.
    pub pings_sent: AtomicU64,
    /// Keep-alive pongs read from sockets.
    pub pongs_received: AtomicU64,
    /// Outbound frames shed by drop-oldest backpressure.
    pub outbound_dropped: AtomicU64,
    /// Inbound WebSocket frames that failed to decode.
    pub decode_failures: AtomicU64,
    /// Frames discarded by routing validation (no session id, unknown or
    /// closed session, tenant mismatch).
    pub frames_discarded: AtomicU64,
    /// Bus publish failures while bridging.
    pub publish_errors: AtomicU64,
}

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DataStore>,
    pub bus: Arc<dyn MessageBus>,
    pub rbac: Arc<dyn RemoteTerminalAccess>,
    pub config: Arc<Config>,
    pub telemetry: Arc<Telemetry>,
    pub devices: Arc<DeviceConnections>,
    /// Cancelled when the process shuts down; every connection scope is
    /// chained from it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        store: Arc<dyn DataStore>,
        bus: Arc<dyn MessageBus>,
        rbac: Arc<dyn RemoteTerminalAccess>,
        config: Arc<Config>,
    ) -> Self {
        AppState {
            store,
            bus,
            rbac,
            config,
            telemetry: Arc::new(Telemetry::default()),
            devices: Arc::new(DeviceConnections::default()),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            &format!("{API_MANAGEMENT}/devices/:device_id"),
            get(management::get_device),
        )
        .route(
            &format!("{API_MANAGEMENT}/devices/:device_id/connect"),
            get(management::connect),
        )
        .route(
            &format!("{API_INTERNAL}/devices/:device_id/connect"),
            get(device::connect),
        )
        .route(&format!("{API_INTERNAL}/health"), get(health))
        .route(&format!("{API_INTERNAL}/alive"), get(alive))
        .with_state(state)
}

async fn alive() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn health(State(state): State<AppState>) -> Response {
    let request_id = new_request_id();
    match state.store.ping().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            ApiError::internal(&request_id, format!("store unreachable: {err}")).into_response()
        }
    }
}

/// Fresh id tying a request's error body to its log lines.
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// An error reply with the `{error, request_id}` JSON body every surfaced
/// error carries.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub request_id: String,
}

impl ApiError {
    pub fn new(status: StatusCode, request_id: &str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
            request_id: request_id.to_string(),
        }
    }

    pub fn unauthorized(request_id: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, request_id, message)
    }

    pub fn forbidden(request_id: &str) -> Self {
        Self::new(StatusCode::FORBIDDEN, request_id, "forbidden")
    }

    pub fn not_found(request_id: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, request_id, message)
    }

    pub fn bad_request(request_id: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, request_id, message)
    }

    pub fn internal(request_id: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, request_id, message)
    }

    /// Map a store failure on a lookup path.
    pub fn from_store(request_id: &str, err: StoreError, missing: &str) -> Self {
        match err {
            StoreError::NotFound => Self::not_found(request_id, missing),
            other => Self::internal(request_id, other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "request_id": self.request_id,
        }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::bus::MemoryBus;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryBus::new()),
            Arc::new(AllowAll),
            Arc::new(Config::default()),
        )
    }

    #[tokio::test]
    async fn alive_returns_no_content() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/internal/v1/deviceconnect/alive")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn health_pings_the_store() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/internal/v1/deviceconnect/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn api_error_body_shape() {
        let err = ApiError::not_found("rid-1", "device not found");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "device not found");
        assert_eq!(json["request_id"], "rid-1");
    }
}
