//! In-memory store: dashmap-backed, used by tests and single-node deployments.
//!
//! Uniqueness and immutability rules are enforced here so tests exercise the
//! same error taxonomy a SQL-backed store would produce. `with_transaction`
//! runs the closure directly; there is no rollback.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::entities::{
    AffinityGroup, Backend, DownloadJob, Event, FunctionEntry, Model, RawEvent, RemoteHook,
};

use super::{
    AffinityGroupStore, BackendStore, DownloadJobStore, EventStore, FunctionStore, KvStore,
    ModelStore, RemoteHookStore, Store, StoreError, StoreResult, TxFn,
};

const MAX_EVENT_ROWS: usize = 100_000;

#[derive(Default)]
pub struct InMemoryStore {
    backends: DashMap<String, Backend>,
    models: DashMap<String, Model>,
    groups: DashMap<String, AffinityGroup>,
    group_backends: DashMap<String, HashSet<String>>,
    group_models: DashMap<String, HashSet<String>>,
    kv: DashMap<String, serde_json::Value>,
    jobs: Mutex<Vec<DownloadJob>>,
    functions: DashMap<String, FunctionEntry>,
    remote_hooks: DashMap<String, RemoteHook>,
    events: Mutex<Vec<Event>>,
    raw_events: Mutex<Vec<RawEvent>>,
    next_nid: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackendStore for InMemoryStore {
    async fn create_backend(&self, backend: Backend) -> StoreResult<()> {
        if self.backends.contains_key(&backend.id) {
            return Err(StoreError::UniqueViolation(format!(
                "backend id {}",
                backend.id
            )));
        }
        if self
            .backends
            .iter()
            .any(|b| b.value().base_url == backend.base_url)
        {
            return Err(StoreError::UniqueViolation(format!(
                "backend base_url {}",
                backend.base_url
            )));
        }
        self.backends.insert(backend.id.clone(), backend);
        Ok(())
    }

    async fn get_backend(&self, id: &str) -> StoreResult<Backend> {
        self.backends
            .get(id)
            .map(|b| b.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn get_backend_by_name(&self, name: &str) -> StoreResult<Backend> {
        self.backends
            .iter()
            .find(|b| b.value().name == name)
            .map(|b| b.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn update_backend(&self, backend: Backend) -> StoreResult<()> {
        if !self.backends.contains_key(&backend.id) {
            return Err(StoreError::NotFound);
        }
        if self
            .backends
            .iter()
            .any(|b| b.key() != &backend.id && b.value().base_url == backend.base_url)
        {
            return Err(StoreError::UniqueViolation(format!(
                "backend base_url {}",
                backend.base_url
            )));
        }
        self.backends.insert(backend.id.clone(), backend);
        Ok(())
    }

    async fn delete_backend(&self, id: &str) -> StoreResult<()> {
        self.backends
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)?;
        for mut entry in self.group_backends.iter_mut() {
            entry.value_mut().remove(id);
        }
        Ok(())
    }

    async fn list_backends(&self) -> StoreResult<Vec<Backend>> {
        let mut backends: Vec<_> = self.backends.iter().map(|b| b.value().clone()).collect();
        backends.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(backends)
    }
}

#[async_trait]
impl ModelStore for InMemoryStore {
    async fn create_model(&self, model: Model) -> StoreResult<()> {
        if model.context_length == 0 {
            return Err(StoreError::ConstraintViolation(
                "context_length must be positive".into(),
            ));
        }
        if self.models.contains_key(&model.id) {
            return Err(StoreError::UniqueViolation(format!("model id {}", model.id)));
        }
        if self.models.iter().any(|m| m.value().name == model.name) {
            return Err(StoreError::UniqueViolation(format!(
                "model name {}",
                model.name
            )));
        }
        self.models.insert(model.id.clone(), model);
        Ok(())
    }

    async fn get_model(&self, id: &str) -> StoreResult<Model> {
        self.models
            .get(id)
            .map(|m| m.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn get_model_by_name(&self, name: &str) -> StoreResult<Model> {
        self.models
            .iter()
            .find(|m| m.value().name == name)
            .map(|m| m.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn update_model(&self, model: Model) -> StoreResult<()> {
        if model.context_length == 0 {
            return Err(StoreError::ConstraintViolation(
                "context_length must be positive".into(),
            ));
        }
        if !self.models.contains_key(&model.id) {
            return Err(StoreError::NotFound);
        }
        self.models.insert(model.id.clone(), model);
        Ok(())
    }

    async fn delete_model(&self, id: &str) -> StoreResult<()> {
        self.models
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)?;
        for mut entry in self.group_models.iter_mut() {
            entry.value_mut().remove(id);
        }
        Ok(())
    }

    async fn list_models(&self) -> StoreResult<Vec<Model>> {
        let mut models: Vec<_> = self.models.iter().map(|m| m.value().clone()).collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }
}

#[async_trait]
impl AffinityGroupStore for InMemoryStore {
    async fn create_group(&self, group: AffinityGroup) -> StoreResult<()> {
        if self.groups.contains_key(&group.id) {
            return Err(StoreError::UniqueViolation(format!("group id {}", group.id)));
        }
        self.groups.insert(group.id.clone(), group);
        Ok(())
    }

    async fn get_group(&self, id: &str) -> StoreResult<AffinityGroup> {
        self.groups
            .get(id)
            .map(|g| g.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn update_group(&self, group: AffinityGroup) -> StoreResult<()> {
        let existing = self.get_group(&group.id).await?;
        if existing.immutable() {
            return Err(StoreError::Immutable("embedding group".into()));
        }
        self.groups.insert(group.id.clone(), group);
        Ok(())
    }

    async fn delete_group(&self, id: &str) -> StoreResult<()> {
        let existing = self.get_group(id).await?;
        if existing.immutable() {
            return Err(StoreError::Immutable("embedding group".into()));
        }
        self.groups.remove(id);
        self.group_backends.remove(id);
        self.group_models.remove(id);
        Ok(())
    }

    async fn list_groups(&self) -> StoreResult<Vec<AffinityGroup>> {
        let mut groups: Vec<_> = self.groups.iter().map(|g| g.value().clone()).collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn list_groups_by_purpose(&self, purpose: &str) -> StoreResult<Vec<AffinityGroup>> {
        let mut groups: Vec<_> = self
            .groups
            .iter()
            .filter(|g| g.value().purpose_type == purpose)
            .map(|g| g.value().clone())
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn assign_backend(&self, group_id: &str, backend_id: &str) -> StoreResult<()> {
        if !self.groups.contains_key(group_id) {
            return Err(StoreError::ForeignKeyViolation(format!("group {group_id}")));
        }
        if !self.backends.contains_key(backend_id) {
            return Err(StoreError::ForeignKeyViolation(format!(
                "backend {backend_id}"
            )));
        }
        self.group_backends
            .entry(group_id.to_string())
            .or_default()
            .insert(backend_id.to_string());
        Ok(())
    }

    async fn unassign_backend(&self, group_id: &str, backend_id: &str) -> StoreResult<()> {
        let removed = self
            .group_backends
            .get_mut(group_id)
            .map(|mut set| set.remove(backend_id))
            .unwrap_or(false);
        if removed {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn list_group_backends(&self, group_id: &str) -> StoreResult<Vec<String>> {
        let mut ids: Vec<_> = self
            .group_backends
            .get(group_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    async fn assign_model(&self, group_id: &str, model_id: &str) -> StoreResult<()> {
        if !self.groups.contains_key(group_id) {
            return Err(StoreError::ForeignKeyViolation(format!("group {group_id}")));
        }
        if !self.models.contains_key(model_id) {
            return Err(StoreError::ForeignKeyViolation(format!("model {model_id}")));
        }
        self.group_models
            .entry(group_id.to_string())
            .or_default()
            .insert(model_id.to_string());
        Ok(())
    }

    async fn unassign_model(&self, group_id: &str, model_id: &str) -> StoreResult<()> {
        let removed = self
            .group_models
            .get_mut(group_id)
            .map(|mut set| set.remove(model_id))
            .unwrap_or(false);
        if removed {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn list_group_models(&self, group_id: &str) -> StoreResult<Vec<String>> {
        let mut ids: Vec<_> = self
            .group_models
            .get(group_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn kv_get(&self, key: &str) -> StoreResult<serde_json::Value> {
        self.kv
            .get(key)
            .map(|v| v.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn kv_set(&self, key: &str, value: serde_json::Value) -> StoreResult<()> {
        self.kv.insert(key.to_string(), value);
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> StoreResult<()> {
        self.kv.remove(key).map(|_| ()).ok_or(StoreError::NotFound)
    }

    async fn kv_list(&self, prefix: &str) -> StoreResult<HashMap<String, serde_json::Value>> {
        Ok(self
            .kv
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }
}

#[async_trait]
impl DownloadJobStore for InMemoryStore {
    async fn append_download_job(&self, job: DownloadJob) -> StoreResult<()> {
        let mut jobs = self.jobs.lock().await;
        if jobs.iter().any(|j| j.base_url == job.base_url) {
            return Ok(());
        }
        jobs.push(job);
        Ok(())
    }

    async fn pop_download_job(&self, now: DateTime<Utc>) -> StoreResult<Option<DownloadJob>> {
        let mut jobs = self.jobs.lock().await;
        // Expired jobs are discarded on the way past.
        jobs.retain(|j| j.valid_until > now);
        let due = jobs.iter().position(|j| j.scheduled_for <= now);
        Ok(due.map(|i| jobs.remove(i)))
    }

    async fn delete_download_jobs(&self, base_url: &str) -> StoreResult<()> {
        let mut jobs = self.jobs.lock().await;
        jobs.retain(|j| j.base_url != base_url);
        Ok(())
    }

    async fn list_download_jobs(&self) -> StoreResult<Vec<DownloadJob>> {
        Ok(self.jobs.lock().await.clone())
    }
}

#[async_trait]
impl FunctionStore for InMemoryStore {
    async fn create_function(&self, function: FunctionEntry) -> StoreResult<()> {
        if self.functions.contains_key(&function.name) {
            return Err(StoreError::UniqueViolation(format!(
                "function {}",
                function.name
            )));
        }
        self.functions.insert(function.name.clone(), function);
        Ok(())
    }

    async fn get_function(&self, name: &str) -> StoreResult<FunctionEntry> {
        self.functions
            .get(name)
            .map(|f| f.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn update_function(&self, function: FunctionEntry) -> StoreResult<()> {
        if !self.functions.contains_key(&function.name) {
            return Err(StoreError::NotFound);
        }
        self.functions.insert(function.name.clone(), function);
        Ok(())
    }

    async fn delete_function(&self, name: &str) -> StoreResult<()> {
        self.functions
            .remove(name)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn list_functions(&self) -> StoreResult<Vec<FunctionEntry>> {
        let mut functions: Vec<_> = self.functions.iter().map(|f| f.value().clone()).collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(functions)
    }
}

#[async_trait]
impl RemoteHookStore for InMemoryStore {
    async fn create_remote_hook(&self, hook: RemoteHook) -> StoreResult<()> {
        if self.remote_hooks.contains_key(&hook.id) {
            return Err(StoreError::UniqueViolation(format!("hook id {}", hook.id)));
        }
        if self.remote_hooks.iter().any(|h| h.value().name == hook.name) {
            return Err(StoreError::UniqueViolation(format!("hook name {}", hook.name)));
        }
        self.remote_hooks.insert(hook.id.clone(), hook);
        Ok(())
    }

    async fn get_remote_hook(&self, id: &str) -> StoreResult<RemoteHook> {
        self.remote_hooks
            .get(id)
            .map(|h| h.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn get_remote_hook_by_name(&self, name: &str) -> StoreResult<RemoteHook> {
        self.remote_hooks
            .iter()
            .find(|h| h.value().name == name)
            .map(|h| h.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn update_remote_hook(&self, hook: RemoteHook) -> StoreResult<()> {
        if !self.remote_hooks.contains_key(&hook.id) {
            return Err(StoreError::NotFound);
        }
        self.remote_hooks.insert(hook.id.clone(), hook);
        Ok(())
    }

    async fn delete_remote_hook(&self, id: &str) -> StoreResult<()> {
        self.remote_hooks
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn list_remote_hooks(&self) -> StoreResult<Vec<RemoteHook>> {
        let mut hooks: Vec<_> = self.remote_hooks.iter().map(|h| h.value().clone()).collect();
        hooks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(hooks)
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn append_event(&self, mut event: Event) -> StoreResult<Event> {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_EVENT_ROWS {
            return Err(StoreError::MaxRowsReached);
        }
        event.nid = self.next_nid.fetch_add(1, Ordering::SeqCst) + 1;
        events.push(event.clone());
        Ok(event)
    }

    async fn events_by_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Event>> {
        let events = self.events.lock().await;
        Ok(filter_events(
            &events,
            |e| e.aggregate_type == aggregate_type && e.aggregate_id == aggregate_id,
            from,
            to,
            limit,
        ))
    }

    async fn events_by_type(
        &self,
        event_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Event>> {
        let events = self.events.lock().await;
        Ok(filter_events(&events, |e| e.event_type == event_type, from, to, limit))
    }

    async fn events_by_source(
        &self,
        event_source: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Event>> {
        let events = self.events.lock().await;
        Ok(filter_events(
            &events,
            |e| e.event_source == event_source,
            from,
            to,
            limit,
        ))
    }

    async fn append_raw_event(&self, mut event: RawEvent) -> StoreResult<RawEvent> {
        let mut raw_events = self.raw_events.lock().await;
        if raw_events.len() >= MAX_EVENT_ROWS {
            return Err(StoreError::MaxRowsReached);
        }
        event.nid = self.next_nid.fetch_add(1, Ordering::SeqCst) + 1;
        raw_events.push(event.clone());
        Ok(event)
    }

    async fn get_raw_event(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        nid: u64,
    ) -> StoreResult<RawEvent> {
        let raw_events = self.raw_events.lock().await;
        raw_events
            .iter()
            .find(|e| e.nid == nid && e.received_at >= from && e.received_at <= to)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_raw_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<RawEvent>> {
        let raw_events = self.raw_events.lock().await;
        Ok(raw_events
            .iter()
            .filter(|e| e.received_at >= from && e.received_at <= to)
            .take(limit)
            .cloned()
            .collect())
    }
}

fn filter_events(
    events: &[Event],
    predicate: impl Fn(&Event) -> bool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    limit: usize,
) -> Vec<Event> {
    events
        .iter()
        .filter(|e| predicate(e) && e.created_at >= from && e.created_at <= to)
        .take(limit)
        .cloned()
        .collect()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn with_transaction<'a>(&'a self, f: TxFn<'a>) -> StoreResult<()> {
        f(self).await
    }
}
