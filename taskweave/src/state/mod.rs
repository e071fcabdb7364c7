//! Runtime state: the reconciler's published view of every declared backend.
//!
//! [`RuntimeStateService::run_backend_cycle`] performs one reconcile tick:
//! it compares declared backends/models with what each backend actually
//! serves, queues downloads for missing models, and publishes a fresh
//! immutable snapshot. Consumers ([`crate::provider::ProviderResolver`]) read
//! the snapshot through [`RuntimeSnapshot`]; they never trigger network I/O.

mod provider_cache;
mod reconciler;

pub use provider_cache::{Clock, ProviderListingCache, SystemClock};
pub use reconciler::{BackendProbe, HttpBackendProbe};

use std::sync::{Arc, RwLock};

use serde::Serialize;
use thiserror::Error;

use crate::entities::{Backend, Model};
use crate::provider::GeminiListing;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("reconcile cancelled")]
    Cancelled,
}

/// A model observed live on a backend, enriched with declared capabilities.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PulledModel {
    pub name: String,
    pub context_length: u32,
    pub can_chat: bool,
    pub can_prompt: bool,
    pub can_embed: bool,
    pub can_stream: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
}

impl PulledModel {
    /// Builds the observed entry from a declared model: liveness is observed,
    /// semantics are declared.
    pub fn from_declared(model: &Model) -> Self {
        Self {
            name: model.name.clone(),
            context_length: model.context_length,
            can_chat: model.can_chat,
            can_prompt: model.can_prompt,
            can_embed: model.can_embed,
            can_stream: model.can_stream,
            digest: String::new(),
        }
    }

    pub fn from_gemini(listing: &GeminiListing) -> Self {
        Self {
            name: listing.name.clone(),
            context_length: listing.context_length,
            can_chat: listing.can_chat,
            can_prompt: listing.can_prompt,
            can_embed: listing.can_embed,
            can_stream: listing.can_stream,
            digest: String::new(),
        }
    }
}

/// One backend's reconciled view. Rebuilt every tick; snapshots handed to
/// callers are immutable.
#[derive(Debug, Clone, Serialize)]
pub struct BackendRuntimeState {
    pub backend: Backend,
    /// Model names this backend must serve, after affinity aggregation.
    pub declared_models: Vec<String>,
    /// Intersection of "present on backend" and "declared".
    pub pulled_models: Vec<PulledModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Held for client construction; never serialized.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl BackendRuntimeState {
    pub fn errored(backend: Backend, declared_models: Vec<String>, error: String) -> Self {
        Self {
            backend,
            declared_models,
            pulled_models: Vec::new(),
            error: Some(error),
            api_key: None,
        }
    }
}

/// Read access to the current snapshot, in backend enumeration order.
pub trait RuntimeSnapshot: Send + Sync {
    fn snapshot(&self) -> Vec<Arc<BackendRuntimeState>>;
}

/// Reconciler policy knobs, sourced from [`config::RuntimeConfig`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcilerOptions {
    /// Aggregate declared models per affinity group instead of globally.
    pub affinity_aware: bool,
    /// Leave present-but-undeclared models on ollama backends in place.
    pub skip_delete_undeclared: bool,
}

impl From<&::config::RuntimeConfig> for ReconcilerOptions {
    fn from(cfg: &::config::RuntimeConfig) -> Self {
        Self {
            affinity_aware: cfg.affinity_aware,
            skip_delete_undeclared: cfg.skip_delete_undeclared,
        }
    }
}

/// The reconciler service. One instance per process; ticks must not run
/// concurrently with each other, which the external driver guarantees.
pub struct RuntimeStateService {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) probe: Arc<dyn BackendProbe>,
    pub(crate) options: ReconcilerOptions,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) openai_cache: ProviderListingCache<Vec<String>>,
    pub(crate) gemini_cache: ProviderListingCache<Vec<GeminiListing>>,
    snapshot: RwLock<Arc<Vec<Arc<BackendRuntimeState>>>>,
}

impl RuntimeStateService {
    pub fn new(store: Arc<dyn Store>, options: ReconcilerOptions) -> Self {
        Self::with_probe_and_clock(store, options, Arc::new(HttpBackendProbe::new()), Arc::new(SystemClock))
    }

    pub fn with_probe_and_clock(
        store: Arc<dyn Store>,
        options: ReconcilerOptions,
        probe: Arc<dyn BackendProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            probe,
            options,
            clock,
            openai_cache: ProviderListingCache::new(),
            gemini_cache: ProviderListingCache::new(),
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Publishes a freshly built snapshot. Entries for backends absent from
    /// the tick's active set are dropped implicitly: the new vector replaces
    /// the old wholesale.
    pub(crate) fn publish(&self, states: Vec<Arc<BackendRuntimeState>>) {
        let mut guard = self.snapshot.write().expect("state snapshot lock poisoned");
        *guard = Arc::new(states);
    }

    /// Current state for one backend id, when present in the snapshot.
    pub fn get(&self, backend_id: &str) -> Option<Arc<BackendRuntimeState>> {
        self.snapshot()
            .into_iter()
            .find(|s| s.backend.id == backend_id)
    }
}

impl RuntimeSnapshot for RuntimeStateService {
    fn snapshot(&self) -> Vec<Arc<BackendRuntimeState>> {
        let guard = self.snapshot.read().expect("state snapshot lock poisoned");
        guard.as_ref().clone()
    }
}
