//! Management endpoint
//!
//! User-side surface of the management API: device status lookup and the
//! WebSocket handler that owns a session for the lifetime of the
//! connection. A management connection moves through `authenticating ->
//! authorizing -> preparing -> bridging -> tearing_down -> closed`;
//! errors before bridging surface as HTTP status codes without an
//! upgrade, errors while bridging become close frames.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::WebSocket;
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{debug, warn};

use crate::auth::{self, Identity};
use crate::bus;
use crate::proto::{codec, ProtoMsg, PropertyValue, PROP_USER_ID};
use crate::store::{Device, DeviceStatus, Session, SessionStatus};

use super::conn::{ConnConfig, Connection, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL};
use super::{new_request_id, ApiError, AppState};

/// Lifecycle of one management connection, for the logs.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Authenticating,
    Authorizing,
    Preparing,
    Bridging,
    TearingDown,
    Closed,
}

#[derive(Debug, Serialize)]
struct DeviceStatusBody {
    device_id: String,
    status: DeviceStatus,
}

/// `GET /api/management/v1/deviceconnect/devices/{id}`
pub async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let request_id = new_request_id();

    let identity = match Identity::from_headers(&headers) {
        Ok(identity) => identity,
        Err(err) => return ApiError::unauthorized(&request_id, err.to_string()).into_response(),
    };
    if !identity.is_user {
        return ApiError::unauthorized(&request_id, "user identity required").into_response();
    }

    match state.store.get_device(&identity.tenant, &device_id).await {
        Ok(device) => Json(DeviceStatusBody {
            device_id: device.device_id,
            status: device.status,
        })
        .into_response(),
        Err(err) => ApiError::from_store(&request_id, err, "device not found").into_response(),
    }
}

/// `GET /api/management/v1/deviceconnect/devices/{id}/connect`
pub async fn connect(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, axum::extract::ws::rejection::WebSocketUpgradeRejection>,
) -> Response {
    let request_id = new_request_id();
    debug!(%request_id, %device_id, phase = ?Phase::Authenticating, "management connect");

    let identity = match Identity::from_headers(&headers) {
        Ok(identity) => identity,
        Err(err) => return ApiError::unauthorized(&request_id, err.to_string()).into_response(),
    };
    if !identity.is_user {
        return ApiError::unauthorized(&request_id, "user identity required").into_response();
    }

    if let Some(groups) = auth::rbac_groups(&headers) {
        debug!(%request_id, phase = ?Phase::Authorizing, ?groups, "rbac allow-check");
        match state
            .rbac
            .allowed(&identity.tenant, &device_id, &groups)
            .await
        {
            Ok(true) => {}
            Ok(false) => return ApiError::forbidden(&request_id).into_response(),
            Err(err) => {
                warn!(%request_id, error = %err, "rbac allow-check failed");
                return ApiError::internal(&request_id, "internal error").into_response();
            }
        }
    }

    debug!(%request_id, phase = ?Phase::Preparing, "preparing session");
    let device = match state.store.get_device(&identity.tenant, &device_id).await {
        Ok(device) => device,
        Err(err) => {
            return ApiError::from_store(&request_id, err, "device not found").into_response()
        }
    };
    if device.status != DeviceStatus::Connected {
        return ApiError::not_found(&request_id, "device not connected").into_response();
    }

    let session = match state
        .store
        .upsert_session(Session::new(&identity.tenant, &identity.subject, &device_id))
        .await
    {
        Ok(session) => session,
        Err(err) => {
            return ApiError::from_store(&request_id, err, "device not found").into_response()
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(_) => {
            // the session just created must not leak
            close_session(&state, &identity.tenant, &session.session_id).await;
            return ApiError::bad_request(&request_id, "websocket upgrade required")
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| user_session(state, identity, device, session, socket, request_id))
}

async fn user_session(
    state: AppState,
    identity: Identity,
    device: Device,
    session: Session,
    socket: WebSocket,
    request_id: String,
) {
    let tenant = identity.tenant;
    let user_id = identity.subject;
    let session_subject = bus::session_subject(&tenant, &session.session_id);
    let device_subject = bus::device_subject(&tenant, &device.device_id);

    let (conn, mut inbound) = Connection::spawn(
        socket,
        ConnConfig::from(&*state.config),
        Arc::clone(&state.telemetry),
    );

    let subscription = match state.bus.subscribe(&session_subject).await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(%request_id, subject = %session_subject, error = %err, "session subject subscription failed");
            conn.close(CLOSE_INTERNAL_ERROR, "message bus unavailable");
            conn.closed().await;
            close_session(&state, &tenant, &session.session_id).await;
            return;
        }
    };

    // user-bound frames pass through verbatim
    let drain = tokio::spawn({
        let conn = conn.clone();
        async move {
            let cancelled = conn.cancelled();
            let mut subscription = subscription;
            loop {
                let payload = tokio::select! {
                    _ = cancelled.cancelled() => break,
                    payload = subscription.next() => payload,
                };
                let Some(payload) = payload else { break };
                conn.send(payload);
            }
        }
    });

    debug!(%request_id, session_id = %session.session_id, phase = ?Phase::Bridging, "session bridged");
    let shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                conn.close(CLOSE_GOING_AWAY, "server shutting down");
                break;
            }
            msg = inbound.recv() => {
                let Some(mut msg) = msg else { break };
                // server-side stamp overrides whatever the client claimed
                msg.header.session_id = session.session_id.clone();
                msg.header.properties.insert(
                    PROP_USER_ID.to_string(),
                    PropertyValue::from(user_id.clone()),
                );
                if let Err(err) = state.bus.publish(&device_subject, codec::encode(&msg)).await {
                    state
                        .telemetry
                        .publish_errors
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(%request_id, subject = %device_subject, error = %err, "publish failed");
                }
            }
        }
    }

    debug!(%request_id, session_id = %session.session_id, phase = ?Phase::TearingDown, "tearing down");
    // tear down the device-side shell even after an abrupt user close
    let stop = ProtoMsg::stop_shell(&session.session_id, &user_id);
    if let Err(err) = state
        .bus
        .publish(&device_subject, codec::encode(&stop))
        .await
    {
        state
            .telemetry
            .publish_errors
            .fetch_add(1, Ordering::Relaxed);
        warn!(%request_id, error = %err, "failed to publish stop frame");
    }

    close_session(&state, &tenant, &session.session_id).await;
    conn.close(CLOSE_NORMAL, "");
    conn.closed().await;
    let _ = drain.await;
    debug!(%request_id, session_id = %session.session_id, phase = ?Phase::Closed, "management connection closed");
}

/// Mark the session closed. A store failure here leaves the record
/// `active` for the reconciliation sweeper, never the socket open.
async fn close_session(state: &AppState, tenant: &str, session_id: &str) {
    if let Err(err) = state
        .store
        .set_session_status(tenant, session_id, SessionStatus::Closed)
        .await
    {
        warn!(%session_id, error = %err, "failed to close session record");
    }
}
