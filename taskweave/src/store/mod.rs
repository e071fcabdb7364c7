//! Persistence contract for declared entities.
//!
//! The runtime consumes a transactional store through these traits; it never
//! sees SQL or connection details. `not-found` is a first-class result when a
//! specific entity is looked up; every other error propagates. The in-memory
//! implementation in [`memory`] backs the test suite and single-node use.

mod memory;

pub use memory::InMemoryStore;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use thiserror::Error;

use crate::entities::{
    AffinityGroup, Backend, DownloadJob, Event, FunctionEntry, Model, RawEvent, RemoteHook,
};

/// Store failure taxonomy. Callers branch on `NotFound`; the remaining kinds
/// map to conflict/validation responses in outer layers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("immutable: {0}")]
    Immutable(String),
    #[error("max rows reached")]
    MaxRowsReached,
    #[error("serialization failure")]
    SerializationFailure,
    #[error("deadlock detected")]
    Deadlock,
    #[error("store failure: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Work executed inside one transaction scope.
pub type TxFn<'a> = Box<dyn FnOnce(&'a dyn Store) -> BoxFuture<'a, StoreResult<()>> + Send + 'a>;

#[async_trait]
pub trait BackendStore: Send + Sync {
    async fn create_backend(&self, backend: Backend) -> StoreResult<()>;
    async fn get_backend(&self, id: &str) -> StoreResult<Backend>;
    async fn get_backend_by_name(&self, name: &str) -> StoreResult<Backend>;
    async fn update_backend(&self, backend: Backend) -> StoreResult<()>;
    async fn delete_backend(&self, id: &str) -> StoreResult<()>;
    async fn list_backends(&self) -> StoreResult<Vec<Backend>>;
}

#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn create_model(&self, model: Model) -> StoreResult<()>;
    async fn get_model(&self, id: &str) -> StoreResult<Model>;
    async fn get_model_by_name(&self, name: &str) -> StoreResult<Model>;
    async fn update_model(&self, model: Model) -> StoreResult<()>;
    async fn delete_model(&self, id: &str) -> StoreResult<()>;
    async fn list_models(&self) -> StoreResult<Vec<Model>>;
}

#[async_trait]
pub trait AffinityGroupStore: Send + Sync {
    async fn create_group(&self, group: AffinityGroup) -> StoreResult<()>;
    async fn get_group(&self, id: &str) -> StoreResult<AffinityGroup>;
    async fn update_group(&self, group: AffinityGroup) -> StoreResult<()>;
    async fn delete_group(&self, id: &str) -> StoreResult<()>;
    async fn list_groups(&self) -> StoreResult<Vec<AffinityGroup>>;
    async fn list_groups_by_purpose(&self, purpose: &str) -> StoreResult<Vec<AffinityGroup>>;

    async fn assign_backend(&self, group_id: &str, backend_id: &str) -> StoreResult<()>;
    async fn unassign_backend(&self, group_id: &str, backend_id: &str) -> StoreResult<()>;
    async fn list_group_backends(&self, group_id: &str) -> StoreResult<Vec<String>>;

    async fn assign_model(&self, group_id: &str, model_id: &str) -> StoreResult<()>;
    async fn unassign_model(&self, group_id: &str, model_id: &str) -> StoreResult<()>;
    async fn list_group_models(&self, group_id: &str) -> StoreResult<Vec<String>>;
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn kv_get(&self, key: &str) -> StoreResult<serde_json::Value>;
    async fn kv_set(&self, key: &str, value: serde_json::Value) -> StoreResult<()>;
    async fn kv_delete(&self, key: &str) -> StoreResult<()>;
    async fn kv_list(&self, prefix: &str) -> StoreResult<HashMap<String, serde_json::Value>>;
}

#[async_trait]
pub trait DownloadJobStore: Send + Sync {
    /// Enqueues a job. A pending job with the same `base_url` already in the
    /// queue makes this a no-op, which bounds the queue to one download per
    /// backend.
    async fn append_download_job(&self, job: DownloadJob) -> StoreResult<()>;
    /// Removes and returns the oldest due job, or `None` when the queue has
    /// nothing ready.
    async fn pop_download_job(&self, now: DateTime<Utc>) -> StoreResult<Option<DownloadJob>>;
    async fn delete_download_jobs(&self, base_url: &str) -> StoreResult<()>;
    async fn list_download_jobs(&self) -> StoreResult<Vec<DownloadJob>>;
}

#[async_trait]
pub trait FunctionStore: Send + Sync {
    async fn create_function(&self, function: FunctionEntry) -> StoreResult<()>;
    async fn get_function(&self, name: &str) -> StoreResult<FunctionEntry>;
    async fn update_function(&self, function: FunctionEntry) -> StoreResult<()>;
    async fn delete_function(&self, name: &str) -> StoreResult<()>;
    async fn list_functions(&self) -> StoreResult<Vec<FunctionEntry>>;
}

#[async_trait]
pub trait RemoteHookStore: Send + Sync {
    async fn create_remote_hook(&self, hook: RemoteHook) -> StoreResult<()>;
    async fn get_remote_hook(&self, id: &str) -> StoreResult<RemoteHook>;
    async fn get_remote_hook_by_name(&self, name: &str) -> StoreResult<RemoteHook>;
    async fn update_remote_hook(&self, hook: RemoteHook) -> StoreResult<()>;
    async fn delete_remote_hook(&self, id: &str) -> StoreResult<()>;
    async fn list_remote_hooks(&self) -> StoreResult<Vec<RemoteHook>>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persists the event and assigns its `nid`. Returns the stored event.
    async fn append_event(&self, event: Event) -> StoreResult<Event>;
    async fn events_by_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Event>>;
    async fn events_by_type(
        &self,
        event_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Event>>;
    async fn events_by_source(
        &self,
        event_source: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Event>>;

    /// Lighter ingestion path for webhook payloads. Assigns the `nid`.
    async fn append_raw_event(&self, event: RawEvent) -> StoreResult<RawEvent>;
    /// Fetches one raw event by nid; the time range bounds the partitions
    /// the lookup may touch.
    async fn get_raw_event(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        nid: u64,
    ) -> StoreResult<RawEvent>;
    async fn list_raw_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<RawEvent>>;
}

/// The full store contract. Implementations that support transactions run the
/// closure atomically; the in-memory store runs it directly.
#[async_trait]
pub trait Store:
    BackendStore
    + ModelStore
    + AffinityGroupStore
    + KvStore
    + DownloadJobStore
    + FunctionStore
    + RemoteHookStore
    + EventStore
{
    async fn with_transaction<'a>(&'a self, f: TxFn<'a>) -> StoreResult<()>;
}

/// Reads a provider config from KV, treating `NotFound` as "no key".
pub async fn get_provider_config(
    store: &dyn Store,
    provider_type: &str,
) -> StoreResult<Option<crate::entities::ProviderConfig>> {
    let key = crate::entities::provider_config_key(provider_type);
    match store.kv_get(&key).await {
        Ok(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::Internal(format!("decode provider config: {e}"))),
        Err(StoreError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Writes a provider config to KV. The key material is never logged.
pub async fn set_provider_config(
    store: &dyn Store,
    config: &crate::entities::ProviderConfig,
) -> StoreResult<()> {
    let key = crate::entities::provider_config_key(&config.provider_type);
    let value = serde_json::to_value(config)
        .map_err(|e| StoreError::Internal(format!("encode provider config: {e}")))?;
    store.kv_set(&key, value).await
}
