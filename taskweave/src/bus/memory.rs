//! In-memory bus: per-subject subscriber lists over mpsc channels.
//!
//! Delivery is fan-out to every live subscriber of the subject. A subscriber
//! that stopped receiving is pruned on the next publish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{BusError, MessageBus, Subscription};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
pub struct InMemoryBus {
    subscribers: Arc<DashMap<String, Vec<(u64, mpsc::Sender<Vec<u8>>)>>>,
    next_id: AtomicU64,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BusError> {
        if let Some(mut entry) = self.subscribers.get_mut(subject) {
            entry.retain(|(_, tx)| !tx.is_closed());
            for (_, tx) in entry.iter() {
                // A full subscriber drops the message rather than stalling the publisher.
                let _ = tx.try_send(payload.to_vec());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .entry(subject.to_string())
            .or_default()
            .push((id, tx));

        let subscribers = self.subscribers.clone();
        let subject = subject.to_string();
        Ok(Subscription::new(
            rx,
            Box::new(move || {
                if let Some(mut entry) = subscribers.get_mut(&subject) {
                    entry.retain(|(sub_id, _)| *sub_id != id);
                }
            }),
        ))
    }
}
