//! Message bus client
//!
//! Publish/subscribe layer that glues the device and management endpoints
//! together, so the two halves of a bridged session can live on different
//! service instances. Delivery is at-most-once and best-effort: order is
//! preserved per publisher per subject, subscriptions buffer a bounded
//! backlog, and messages beyond the backlog are dropped and counted.

mod memory;

pub use memory::MemoryBus;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Default per-subscription backlog before messages are dropped.
pub const DEFAULT_BACKLOG: usize = 64;

/// Bus subject for frames directed at a device.
pub fn device_subject(tenant: &str, device_id: &str) -> String {
    format!("device.{tenant}.{device_id}")
}

/// Bus subject for frames directed at the user end of a session.
pub fn session_subject(tenant: &str, session_id: &str) -> String {
    format!("session.{tenant}.{session_id}")
}

/// Check that a subject is safe to publish on: non-empty, hierarchical,
/// wildcard-free, and free of whitespace and control characters.
pub fn validate_subject(subject: &str) -> Result<(), BusError> {
    if subject.is_empty()
        || subject.starts_with('.')
        || subject.ends_with('.')
        || subject.contains("..")
        || subject
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '*' || c == '>')
    {
        return Err(BusError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message bus unavailable: {0}")]
    Unavailable(String),
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<Bytes>,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(
        rx: mpsc::Receiver<Bytes>,
        unsubscribe: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Subscription {
            rx,
            unsubscribe: Some(unsubscribe),
        }
    }

    /// Next buffered message, or `None` once the subscription is closed
    /// and drained.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Detach from the subject. Buffered messages remain readable.
    pub fn close(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Capability interface for the pub/sub transport. The in-process
/// [`MemoryBus`] is the bundled implementation; an external broker client
/// plugs in behind the same trait.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;
    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;
}
