//! Session store gateway
//!
//! Thin abstraction over persisted device presence and session records.
//! The bridge only ever talks to the [`DataStore`] trait; the bundled
//! [`MemoryStore`] keeps everything in process, and a database-backed
//! gateway plugs in behind the same interface.

mod memory;

pub use memory::MemoryStore;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Presence status of a device record.
///
/// Valid transitions are `unknown -> connected -> disconnected ->
/// connected`; everything else is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Connected,
    Disconnected,
    Unknown,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceStatus::Connected => "connected",
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A device presence record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub tenant_id: String,
    pub device_id: String,
    pub status: DeviceStatus,
    pub updated_at_ms: u64,
}

/// Lifecycle status of a session record. `closed -> active` is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

/// One user<->device bridge instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Server-assigned UUID; empty on insert, filled by the store.
    pub session_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub device_id: String,
    pub status: SessionStatus,
    pub created_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at_ms: Option<u64>,
}

impl Session {
    /// A new, not-yet-stored session for the given user/device pair.
    pub fn new(tenant_id: &str, user_id: &str, device_id: &str) -> Self {
        Session {
            session_id: String::new(),
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            status: SessionStatus::Active,
            created_at_ms: now_ms(),
            closed_at_ms: None,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(&'static str),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Capability interface for device presence and session records.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Returns `Ok` iff the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get_device(&self, tenant: &str, device_id: &str) -> Result<Device, StoreError>;

    /// Create the device record if absent. Idempotent; an existing record
    /// is returned untouched.
    async fn upsert_device(&self, tenant: &str, device_id: &str) -> Result<Device, StoreError>;

    /// Conditionally update presence. No-op when the status is unchanged;
    /// `NotFound` when the device is absent; `Conflict` on a transition
    /// the presence state machine does not allow.
    async fn set_device_status(
        &self,
        tenant: &str,
        device_id: &str,
        status: DeviceStatus,
    ) -> Result<(), StoreError>;

    async fn get_session(&self, tenant: &str, session_id: &str) -> Result<Session, StoreError>;

    /// Insert the session (assigning a fresh UUID when `session_id` is
    /// empty) or update an existing one. Returns the stored record.
    /// The referenced device must exist.
    async fn upsert_session(&self, session: Session) -> Result<Session, StoreError>;

    /// Transition a session `active -> closed`. Reopening a closed
    /// session is refused with `Conflict`.
    async fn set_session_status(
        &self,
        tenant: &str,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError>;

    async fn delete_session(&self, tenant: &str, session_id: &str) -> Result<(), StoreError>;
}

/// Current time as Unix milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
