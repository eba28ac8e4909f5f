//! In-memory data store
//!
//! Keeps device and session records in process. Suitable for
//! single-instance deployments and tests; the trait boundary is where a
//! persistent store plugs in.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{now_ms, DataStore, Device, DeviceStatus, Session, SessionStatus, StoreError};

type Key = (String, String);

#[derive(Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<Key, Device>>,
    sessions: RwLock<HashMap<Key, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every session record, for diagnostics and tests.
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }
}

fn key(tenant: &str, id: &str) -> Key {
    (tenant.to_string(), id.to_string())
}

fn transition_allowed(from: DeviceStatus, to: DeviceStatus) -> bool {
    matches!(
        (from, to),
        (DeviceStatus::Unknown, DeviceStatus::Connected)
            | (DeviceStatus::Connected, DeviceStatus::Disconnected)
            | (DeviceStatus::Disconnected, DeviceStatus::Connected)
    )
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_device(&self, tenant: &str, device_id: &str) -> Result<Device, StoreError> {
        self.devices
            .read()
            .get(&key(tenant, device_id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn upsert_device(&self, tenant: &str, device_id: &str) -> Result<Device, StoreError> {
        let mut devices = self.devices.write();
        let device = devices
            .entry(key(tenant, device_id))
            .or_insert_with(|| Device {
                tenant_id: tenant.to_string(),
                device_id: device_id.to_string(),
                status: DeviceStatus::Unknown,
                updated_at_ms: now_ms(),
            });
        Ok(device.clone())
    }

    async fn set_device_status(
        &self,
        tenant: &str,
        device_id: &str,
        status: DeviceStatus,
    ) -> Result<(), StoreError> {
        let mut devices = self.devices.write();
        let device = devices
            .get_mut(&key(tenant, device_id))
            .ok_or(StoreError::NotFound)?;
        if device.status == status {
            return Ok(());
        }
        if !transition_allowed(device.status, status) {
            return Err(StoreError::Conflict("invalid device status transition"));
        }
        device.status = status;
        device.updated_at_ms = now_ms();
        Ok(())
    }

    async fn get_session(&self, tenant: &str, session_id: &str) -> Result<Session, StoreError> {
        self.sessions
            .read()
            .get(&key(tenant, session_id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn upsert_session(&self, mut session: Session) -> Result<Session, StoreError> {
        if !self
            .devices
            .read()
            .contains_key(&key(&session.tenant_id, &session.device_id))
        {
            return Err(StoreError::NotFound);
        }
        if session.session_id.is_empty() {
            session.session_id = Uuid::new_v4().to_string();
        }
        let mut sessions = self.sessions.write();
        sessions.insert(
            key(&session.tenant_id, &session.session_id),
            session.clone(),
        );
        Ok(session)
    }

    async fn set_session_status(
        &self,
        tenant: &str,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&key(tenant, session_id))
            .ok_or(StoreError::NotFound)?;
        if session.status == status {
            return Ok(());
        }
        if session.status == SessionStatus::Closed {
            return Err(StoreError::Conflict("session already closed"));
        }
        session.status = status;
        session.closed_at_ms = Some(now_ms());
        Ok(())
    }

    async fn delete_session(&self, tenant: &str, session_id: &str) -> Result<(), StoreError> {
        self.sessions
            .write()
            .remove(&key(tenant, session_id))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_device_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.upsert_device("t1", "d1").await.unwrap();
        assert_eq!(first.status, DeviceStatus::Unknown);

        store
            .set_device_status("t1", "d1", DeviceStatus::Connected)
            .await
            .unwrap();
        let again = store.upsert_device("t1", "d1").await.unwrap();
        assert_eq!(again.status, DeviceStatus::Connected, "upsert left record untouched");
    }

    #[tokio::test]
    async fn device_status_lifecycle() {
        let store = MemoryStore::new();
        store.upsert_device("t1", "d1").await.unwrap();

        store
            .set_device_status("t1", "d1", DeviceStatus::Connected)
            .await
            .unwrap();
        store
            .set_device_status("t1", "d1", DeviceStatus::Disconnected)
            .await
            .unwrap();
        store
            .set_device_status("t1", "d1", DeviceStatus::Connected)
            .await
            .unwrap();

        // same-status update is a no-op
        store
            .set_device_status("t1", "d1", DeviceStatus::Connected)
            .await
            .unwrap();

        // a record never goes back to unknown
        let err = store
            .set_device_status("t1", "d1", DeviceStatus::Unknown)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn set_status_on_absent_device_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .set_device_status("t1", "missing", DeviceStatus::Connected)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound);
    }

    #[tokio::test]
    async fn upsert_session_assigns_id() {
        let store = MemoryStore::new();
        store.upsert_device("t1", "d1").await.unwrap();

        let stored = store
            .upsert_session(Session::new("t1", "u1", "d1"))
            .await
            .unwrap();
        assert!(!stored.session_id.is_empty());
        assert_eq!(stored.status, SessionStatus::Active);

        let fetched = store.get_session("t1", &stored.session_id).await.unwrap();
        assert_eq!(fetched, stored);
    }

    #[tokio::test]
    async fn upsert_session_requires_device() {
        let store = MemoryStore::new();
        let err = store
            .upsert_session(Session::new("t1", "u1", "ghost"))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound);
    }

    #[tokio::test]
    async fn session_close_is_one_way() {
        let store = MemoryStore::new();
        store.upsert_device("t1", "d1").await.unwrap();
        let session = store
            .upsert_session(Session::new("t1", "u1", "d1"))
            .await
            .unwrap();

        store
            .set_session_status("t1", &session.session_id, SessionStatus::Closed)
            .await
            .unwrap();
        let closed = store.get_session("t1", &session.session_id).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(closed.closed_at_ms.is_some());

        let err = store
            .set_session_status("t1", &session.session_id, SessionStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // closing twice stays a no-op
        store
            .set_session_status("t1", &session.session_id, SessionStatus::Closed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_session() {
        let store = MemoryStore::new();
        store.upsert_device("t1", "d1").await.unwrap();
        let session = store
            .upsert_session(Session::new("t1", "u1", "d1"))
            .await
            .unwrap();

        store
            .delete_session("t1", &session.session_id)
            .await
            .unwrap();
        assert_eq!(
            store.get_session("t1", &session.session_id).await,
            Err(StoreError::NotFound)
        );
        assert_eq!(
            store.delete_session("t1", &session.session_id).await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let store = MemoryStore::new();
        store.upsert_device("t1", "d1").await.unwrap();
        assert_eq!(
            store.get_device("t2", "d1").await,
            Err(StoreError::NotFound)
        );
    }
}
