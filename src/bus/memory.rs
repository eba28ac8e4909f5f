//! In-process message bus
//!
//! Subject-keyed fan-out over bounded tokio channels. Shared by every
//! connection in the process; a full subscriber backlog sheds the newest
//! message for that subscriber and bumps the drop counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use super::{validate_subject, BusError, MessageBus, Subscription, DEFAULT_BACKLOG};

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Bytes>,
}

#[derive(Default)]
struct Topics {
    subscribers: HashMap<String, Vec<Subscriber>>,
}

/// In-process [`MessageBus`] implementation.
pub struct MemoryBus {
    topics: Arc<RwLock<Topics>>,
    backlog: usize,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_backlog(DEFAULT_BACKLOG)
    }

    pub fn with_backlog(backlog: usize) -> Self {
        MemoryBus {
            topics: Arc::new(RwLock::new(Topics::default())),
            backlog: backlog.max(1),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Messages shed because a subscriber backlog was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Live subscriptions on a subject.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.topics
            .read()
            .subscribers
            .get(subject)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        validate_subject(subject)?;
        let topics = self.topics.read();
        let Some(subs) = topics.subscribers.get(subject) else {
            return Ok(());
        };
        for sub in subs {
            match sub.tx.try_send(payload.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(subject, subscriber = sub.id, "backlog full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        validate_subject(subject)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.backlog);
        let mut topics = self.topics.write();
        topics
            .subscribers
            .entry(subject.to_string())
            .or_default()
            .push(Subscriber { id, tx });

        let topics_ref = Arc::clone(&self.topics);
        let subject_owned = subject.to_string();
        let unsubscribe = Box::new(move || {
            let mut topics = topics_ref.write();
            if let Some(subs) = topics.subscribers.get_mut(&subject_owned) {
                subs.retain(|s| s.id != id);
                if subs.is_empty() {
                    topics.subscribers.remove(&subject_owned);
                }
            }
        });
        Ok(Subscription::new(rx, unsubscribe))
    }
}
