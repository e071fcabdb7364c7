//! Download orchestration: one model pull at a time, cancellable over the bus.
//!
//! `run_download_cycle` pops at most one due job, opens a cancellable scope
//! with two subtasks (the pull itself and a cancel-watcher on
//! [`SUBJECT_QUEUE_CANCEL`]), and publishes progress on [`SUBJECT_DOWNLOAD`].
//! Cancellation is a successful outcome: the reconciler re-derives the job on
//! its next tick.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{
    CancelMessage, DownloadStatus, MessageBus, SUBJECT_DOWNLOAD, SUBJECT_QUEUE_CANCEL,
};
use crate::provider::{OllamaAdminApi, ProviderError, PullProgress};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("pull failed: {0}")]
    Provider(#[from] ProviderError),
}

/// Executes the provider-specific pull. Split from the orchestrator so cycles
/// are testable without a live backend.
#[async_trait]
pub trait ModelPuller: Send + Sync {
    async fn pull(
        &self,
        cancel: &CancellationToken,
        base_url: &str,
        model: &str,
        progress: mpsc::Sender<PullProgress>,
    ) -> Result<(), ProviderError>;
}

/// Pulls through the ollama management API.
pub struct OllamaPuller;

#[async_trait]
impl ModelPuller for OllamaPuller {
    async fn pull(
        &self,
        cancel: &CancellationToken,
        base_url: &str,
        model: &str,
        progress: mpsc::Sender<PullProgress>,
    ) -> Result<(), ProviderError> {
        let api = OllamaAdminApi::new(base_url);
        api.pull_model(cancel, model, move |p| {
            let _ = progress.try_send(p);
        })
        .await
    }
}

/// Single-worker download queue executor.
pub struct DownloadOrchestrator {
    store: Arc<dyn Store>,
    bus: Arc<dyn MessageBus>,
    puller: Arc<dyn ModelPuller>,
}

impl DownloadOrchestrator {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn MessageBus>) -> Self {
        Self::with_puller(store, bus, Arc::new(OllamaPuller))
    }

    pub fn with_puller(
        store: Arc<dyn Store>,
        bus: Arc<dyn MessageBus>,
        puller: Arc<dyn ModelPuller>,
    ) -> Self {
        Self { store, bus, puller }
    }

    /// Performs at most one download. An empty queue is success.
    pub async fn run_download_cycle(&self, cancel: &CancellationToken) -> Result<(), DownloadError> {
        let Some(job) = self.store.pop_download_job(chrono::Utc::now()).await? else {
            return Ok(());
        };
        info!(model = %job.model_name, base_url = %job.base_url, "starting model download");

        let scope = cancel.child_token();

        // Cancel-watcher: a message whose id matches this job's URL or model
        // cancels the scope. The subscription dies with the scope.
        let mut subscription = match self.bus.subscribe(SUBJECT_QUEUE_CANCEL).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!(error = %e, "queue_cancel subscription unavailable; download not cancellable");
                None
            }
        };
        let watcher = {
            let scope = scope.clone();
            let job_url = job.base_url.clone();
            let job_model = job.model_name.clone();
            let mut subscription = subscription.take();
            tokio::spawn(async move {
                let Some(sub) = subscription.as_mut() else { return };
                loop {
                    tokio::select! {
                        _ = scope.cancelled() => break,
                        msg = sub.next() => {
                            let Some(bytes) = msg else { break };
                            let Ok(cancel_msg) = serde_json::from_slice::<CancelMessage>(&bytes) else {
                                continue;
                            };
                            if cancel_msg.id == job_url || cancel_msg.id == job_model {
                                debug!(id = %cancel_msg.id, "download cancel requested");
                                scope.cancel();
                                break;
                            }
                        }
                    }
                }
            })
        };

        // Progress forwarder: pull reports sync, the bus wants async.
        let (progress_tx, mut progress_rx) = mpsc::channel::<PullProgress>(32);
        let forwarder = {
            let bus = self.bus.clone();
            let model = job.model_name.clone();
            let base_url = job.base_url.clone();
            tokio::spawn(async move {
                while let Some(p) = progress_rx.recv().await {
                    let status = DownloadStatus {
                        model: model.clone(),
                        base_url: base_url.clone(),
                        total: p.total,
                        completed: p.completed,
                        digest: p.digest,
                    };
                    if let Ok(bytes) = serde_json::to_vec(&status) {
                        let _ = bus.publish(SUBJECT_DOWNLOAD, &bytes).await;
                    }
                }
            })
        };

        let result = self
            .puller
            .pull(&scope, &job.base_url, &job.model_name, progress_tx)
            .await;

        scope.cancel();
        let _ = watcher.await;
        let _ = forwarder.await;

        match result {
            Ok(()) => {
                info!(model = %job.model_name, "model download finished");
                Ok(())
            }
            Err(ProviderError::Cancelled) => {
                info!(model = %job.model_name, "model download cancelled");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
