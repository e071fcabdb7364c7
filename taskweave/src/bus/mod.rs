//! Messaging contract: publish/subscribe over named subjects.
//!
//! Only three subject families are used: `model_download` for download
//! progress, `queue_cancel` for download cancellation, and `events.<type>`
//! for outbound event publishing. The runtime consumes the contract; the
//! in-memory implementation covers tests and single-node deployments.

mod memory;

pub use memory::InMemoryBus;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Progress subject for model downloads.
pub const SUBJECT_DOWNLOAD: &str = "model_download";

/// Cancellation subject; payload is a [`CancelMessage`].
pub const SUBJECT_QUEUE_CANCEL: &str = "queue_cancel";

/// Prefix for outbound event subjects.
pub fn event_subject(event_type: &str) -> String {
    format!("events.{event_type}")
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// Download progress, published as JSON on [`SUBJECT_DOWNLOAD`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadStatus {
    pub model: String,
    pub base_url: String,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub digest: String,
}

/// Cancellation request; `id` is a backend base URL or a model name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelMessage {
    pub id: String,
}

/// An active subscription. Dropping it (or calling [`Subscription::unsubscribe`])
/// releases the underlying channel.
pub struct Subscription {
    receiver: mpsc::Receiver<Vec<u8>>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<Vec<u8>>, cancel: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            receiver,
            cancel: Some(cancel),
        }
    }

    /// Receives the next message, or `None` once the subscription closed.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Publish/subscribe transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BusError>;
    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;
}
