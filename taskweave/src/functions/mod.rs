//! Content-addressed cache of compiled JavaScript functions.
//!
//! The store holds the source of truth ([`crate::entities::FunctionEntry`]);
//! the cache holds validated entries keyed by a SHA-256 digest of the source.
//! A periodic sync (guarded by [`CircuitBreaker`]) converges the cache; a
//! targeted [`FunctionCache::sync_one`] handles on-demand refresh; execution
//! recompiles transparently when the stored source drifted since last use.

mod breaker;
mod engine;

pub use breaker::CircuitBreaker;
pub use engine::{JsEngine, JsOutcome};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::entities::{Event, FunctionEntry, SCRIPT_TYPE_JAVASCRIPT};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum FunctionError {
    #[error("function not found: {0}")]
    NotFound(String),
    #[error("unsupported script type: {0}")]
    UnsupportedType(String),
    #[error("compile failed: {0}")]
    Compile(String),
    #[error("engine failure: {0}")]
    Engine(String),
    #[error("execution cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for FunctionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => FunctionError::NotFound(String::new()),
            other => FunctionError::Store(other),
        }
    }
}

/// Deterministic digest of a script source.
pub fn code_hash(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    hash: String,
    source: String,
}

/// What one sync pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub compiled: usize,
    pub removed: usize,
    pub unchanged: usize,
}

pub struct FunctionCache {
    store: Arc<dyn Store>,
    engine: JsEngine,
    entries: DashMap<String, CacheEntry>,
    compilations: AtomicUsize,
}

impl FunctionCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            engine: JsEngine::new(),
            entries: DashMap::new(),
            compilations: AtomicUsize::new(0),
        }
    }

    /// Total compilations performed; observable for drift tests.
    pub fn compilation_count(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }

    /// Reconciles the whole cache with the store: drops stale or changed
    /// entries, compiles missing ones.
    pub async fn sync_all(&self) -> Result<SyncReport, FunctionError> {
        let functions = self.store.list_functions().await.map_err(FunctionError::Store)?;
        let mut report = SyncReport::default();

        // Remove entries whose source of truth is gone or changed.
        let cached_names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for name in cached_names {
            let keep = functions.iter().any(|f| {
                f.name == name
                    && f.script_type == SCRIPT_TYPE_JAVASCRIPT
                    && self
                        .entries
                        .get(&name)
                        .map(|e| e.hash == code_hash(&f.script))
                        .unwrap_or(false)
            });
            if !keep {
                self.entries.remove(&name);
                report.removed += 1;
                debug!(function = %name, "dropped stale cache entry");
            }
        }

        for function in &functions {
            if function.script_type != SCRIPT_TYPE_JAVASCRIPT {
                continue;
            }
            if self.entries.contains_key(&function.name) {
                report.unchanged += 1;
                continue;
            }
            self.compile_into_cache(function).await?;
            report.compiled += 1;
        }

        info!(
            compiled = report.compiled,
            removed = report.removed,
            unchanged = report.unchanged,
            "function cache synced"
        );
        Ok(report)
    }

    /// Targeted sync for one function: drop the cached entry and recompile
    /// from the store.
    pub async fn sync_one(&self, name: &str) -> Result<(), FunctionError> {
        self.entries.remove(name);
        let function = self
            .store
            .get_function(name)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => FunctionError::NotFound(name.to_string()),
                other => FunctionError::Store(other),
            })?;
        if function.script_type != SCRIPT_TYPE_JAVASCRIPT {
            return Err(FunctionError::UnsupportedType(function.script_type));
        }
        self.compile_into_cache(&function).await
    }

    async fn compile_into_cache(&self, function: &FunctionEntry) -> Result<(), FunctionError> {
        self.engine.check(&function.script).await?;
        self.compilations.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(
            function.name.clone(),
            CacheEntry {
                hash: code_hash(&function.script),
                source: function.script.clone(),
            },
        );
        debug!(function = %function.name, "compiled function into cache");
        Ok(())
    }

    /// Cached hash for a function, when present.
    pub fn cached_hash(&self, name: &str) -> Option<String> {
        self.entries.get(name).map(|e| e.hash.clone())
    }

    /// Executes a function against a triggering event. Recompiles first when
    /// the stored source changed since the cache last saw it.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        name: &str,
        event: &Event,
    ) -> Result<JsOutcome, FunctionError> {
        let function = self
            .store
            .get_function(name)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => FunctionError::NotFound(name.to_string()),
                other => FunctionError::Store(other),
            })?;
        if function.script_type != SCRIPT_TYPE_JAVASCRIPT {
            return Err(FunctionError::UnsupportedType(function.script_type));
        }

        let current_hash = code_hash(&function.script);
        let stale = self
            .entries
            .get(name)
            .map(|e| e.hash != current_hash)
            .unwrap_or(true);
        if stale {
            self.compile_into_cache(&function).await?;
        }

        let source = self
            .entries
            .get(name)
            .map(|e| e.source.clone())
            .unwrap_or(function.script);

        let event_value = serde_json::to_value(event).map_err(|e| FunctionError::Engine(e.to_string()))?;
        self.engine
            .execute(cancel, &source, &[("event", event_value)])
            .await
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
