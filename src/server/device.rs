//! Device endpoint
//!
//! WebSocket handler for device-side connections on the internal API.
//! A connected device permanently subscribes to its device subject:
//! frames arriving on the bus are validated and delivered to the socket,
//! and frames arriving on the socket are republished onto the session
//! subject they name. Presence bookkeeping happens on every exit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocket;
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::auth::Identity;
use crate::bus;
use crate::proto::codec;
use crate::store::{DataStore, DeviceStatus, SessionStatus, StoreError};

use super::conn::{
    ConnConfig, Connection, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
    CLOSE_SERVICE_RESTART,
};
use super::{new_request_id, ApiError, AppState};

/// Registry enforcing one live connection per `(tenant, device_id)`.
/// The epoch tells a tearing-down connection whether it still owns the
/// slot, so a replaced connection cannot clobber its successor's
/// presence record.
#[derive(Default)]
pub struct DeviceConnections {
    slots: Mutex<HashMap<(String, String), ActiveDevice>>,
    next_epoch: AtomicU64,
}

struct ActiveDevice {
    epoch: u64,
    conn: Connection,
}

impl DeviceConnections {
    /// Register a new connection, returning its epoch and the connection
    /// it displaced, if any. Last writer wins.
    pub fn claim(
        &self,
        tenant: &str,
        device_id: &str,
        conn: Connection,
    ) -> (u64, Option<Connection>) {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .slots
            .lock()
            .insert(
                (tenant.to_string(), device_id.to_string()),
                ActiveDevice { epoch, conn },
            )
            .map(|active| active.conn);
        (epoch, previous)
    }

    /// Drop the slot if the caller still owns it. Returns whether it did.
    pub fn release(&self, tenant: &str, device_id: &str, epoch: u64) -> bool {
        let key = (tenant.to_string(), device_id.to_string());
        let mut slots = self.slots.lock();
        match slots.get(&key) {
            Some(active) if active.epoch == epoch => {
                slots.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

/// `GET /api/internal/v1/deviceconnect/devices/{id}/connect`
pub async fn connect(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, axum::extract::ws::rejection::WebSocketUpgradeRejection>,
) -> Response {
    let request_id = new_request_id();

    let identity = match Identity::from_headers(&headers) {
        Ok(identity) => identity,
        Err(err) => return ApiError::unauthorized(&request_id, err.to_string()).into_response(),
    };
    if identity.is_user {
        return ApiError::unauthorized(&request_id, "device identity required").into_response();
    }
    if identity.subject != device_id {
        return ApiError::unauthorized(&request_id, "device identity mismatch").into_response();
    }

    // refuse plain HTTP before touching the presence record, so a stray
    // request cannot clobber a live connection's status
    let ws = match ws {
        Ok(ws) => ws,
        Err(_) => {
            return ApiError::bad_request(&request_id, "websocket upgrade required")
                .into_response();
        }
    };

    if let Err(err) = state.store.upsert_device(&identity.tenant, &device_id).await {
        return ApiError::internal(&request_id, err.to_string()).into_response();
    }
    if let Err(err) = state
        .store
        .set_device_status(&identity.tenant, &device_id, DeviceStatus::Connected)
        .await
    {
        return ApiError::internal(&request_id, err.to_string()).into_response();
    }

    debug!(%request_id, %device_id, tenant = %identity.tenant, "device connecting");
    ws.on_upgrade(move |socket| device_session(state, identity, device_id, socket, request_id))
}

async fn device_session(
    state: AppState,
    identity: Identity,
    device_id: String,
    socket: WebSocket,
    request_id: String,
) {
    let tenant = identity.tenant;
    let subject = bus::device_subject(&tenant, &device_id);

    let (conn, mut inbound) = Connection::spawn(
        socket,
        ConnConfig::from(&*state.config),
        Arc::clone(&state.telemetry),
    );

    let (epoch, displaced) = state.devices.claim(&tenant, &device_id, conn.clone());
    if let Some(previous) = displaced {
        debug!(%request_id, %device_id, "device reconnected, replacing live connection");
        previous.close(CLOSE_SERVICE_RESTART, "replaced by a newer connection");
    }

    let subscription = match state.bus.subscribe(&subject).await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(%request_id, %subject, error = %err, "device subject subscription failed");
            conn.close(CLOSE_INTERNAL_ERROR, "message bus unavailable");
            conn.closed().await;
            finish_device(&state, &tenant, &device_id, epoch).await;
            return;
        }
    };

    let drain = tokio::spawn(drain_device_subject(
        subscription,
        conn.clone(),
        state.clone(),
        tenant.clone(),
    ));

    let shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                conn.close(CLOSE_GOING_AWAY, "server shutting down");
                break;
            }
            msg = inbound.recv() => {
                let Some(msg) = msg else { break };
                if msg.header.session_id.is_empty() {
                    state
                        .telemetry
                        .frames_discarded
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let session_subject =
                    bus::session_subject(&tenant, &msg.header.session_id);
                if let Err(err) = state.bus.publish(&session_subject, codec::encode(&msg)).await {
                    state
                        .telemetry
                        .publish_errors
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(%request_id, subject = %session_subject, error = %err, "publish failed");
                }
            }
        }
    }

    conn.close(CLOSE_NORMAL, "");
    conn.closed().await;
    let _ = drain.await;
    finish_device(&state, &tenant, &device_id, epoch).await;
    debug!(%request_id, %device_id, "device connection closed");
}

/// Deliver bus frames to the device socket. Frames that do not belong to
/// a live session of this tenant are discarded and counted.
async fn drain_device_subject(
    mut subscription: bus::Subscription,
    conn: Connection,
    state: AppState,
    tenant: String,
) {
    let cancelled = conn.cancelled();
    loop {
        let payload = tokio::select! {
            _ = cancelled.cancelled() => break,
            payload = subscription.next() => payload,
        };
        let Some(payload) = payload else { break };
        match validate_frame(&state.store, &tenant, &payload).await {
            Ok(()) => conn.send(payload),
            Err(reason) => {
                state
                    .telemetry
                    .frames_discarded
                    .fetch_add(1, Ordering::Relaxed);
                debug!(reason, "discarding device-bound frame");
            }
        }
    }
    // dropping the subscription unsubscribes
}

async fn validate_frame(
    store: &Arc<dyn DataStore>,
    tenant: &str,
    payload: &Bytes,
) -> Result<(), &'static str> {
    let msg = codec::decode(payload).map_err(|_| "undecodable frame")?;
    if msg.header.session_id.is_empty() {
        return Err("missing session id");
    }
    let session = match store.get_session(tenant, &msg.header.session_id).await {
        Ok(session) => session,
        Err(StoreError::NotFound) => return Err("unknown session"),
        Err(_) => return Err("session lookup failed"),
    };
    if session.tenant_id != tenant {
        return Err("tenant mismatch");
    }
    if session.status == SessionStatus::Closed {
        return Err("session closed");
    }
    Ok(())
}

/// Presence and registry bookkeeping shared by every exit path. Only the
/// current slot owner may mark the device disconnected.
async fn finish_device(state: &AppState, tenant: &str, device_id: &str, epoch: u64) {
    if !state.devices.release(tenant, device_id, epoch) {
        return;
    }
    if let Err(err) = state
        .store
        .set_device_status(tenant, device_id, DeviceStatus::Disconnected)
        .await
    {
        warn!(%device_id, error = %err, "failed to mark device disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_of_unclaimed_slot_is_a_no_op() {
        let registry = DeviceConnections::default();
        assert!(!registry.release("t1", "d1", 0));
        assert!(registry.is_empty());
    }
}
