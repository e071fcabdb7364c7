//! One reconcile tick: converge observed backend state toward declared state.
//!
//! The tick never fails on a single backend; per-backend problems are recorded
//! in that backend's state entry. Only store access and cancellation abort it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::entities::{Backend, BackendType, DownloadJob, Model};
use crate::provider::{gemini, ollama, openai, vllm, GeminiListing, OllamaModelSummary, ProviderError};
use crate::store::{get_provider_config, StoreError};

use super::{BackendRuntimeState, PulledModel, RuntimeStateService, StateError};

/// How long an enqueued download stays valid before the queue discards it.
const JOB_VALIDITY_HOURS: i64 = 24;

/// Network probes the reconciler runs against backends. Separated from the
/// service so ticks are testable without listeners.
#[async_trait]
pub trait BackendProbe: Send + Sync {
    async fn ollama_list(&self, base_url: &str) -> Result<Vec<OllamaModelSummary>, ProviderError>;
    async fn ollama_delete(&self, base_url: &str, model: &str) -> Result<(), ProviderError>;
    async fn vllm_list(&self, base_url: &str) -> Result<Vec<String>, ProviderError>;
    async fn openai_list(&self, base_url: &str, api_key: &str) -> Result<Vec<String>, ProviderError>;
    async fn gemini_list(&self, base_url: &str, api_key: &str) -> Result<Vec<GeminiListing>, ProviderError>;
}

/// Probe implementation over the real provider wire APIs.
pub struct HttpBackendProbe;

impl HttpBackendProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpBackendProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendProbe for HttpBackendProbe {
    async fn ollama_list(&self, base_url: &str) -> Result<Vec<OllamaModelSummary>, ProviderError> {
        ollama::OllamaAdminApi::new(base_url).list_models().await
    }

    async fn ollama_delete(&self, base_url: &str, model: &str) -> Result<(), ProviderError> {
        ollama::OllamaAdminApi::new(base_url).delete_model(model).await
    }

    async fn vllm_list(&self, base_url: &str) -> Result<Vec<String>, ProviderError> {
        vllm::list_served_models(base_url).await
    }

    async fn openai_list(&self, base_url: &str, api_key: &str) -> Result<Vec<String>, ProviderError> {
        openai::list_models(base_url, Some(api_key)).await
    }

    async fn gemini_list(&self, base_url: &str, api_key: &str) -> Result<Vec<GeminiListing>, ProviderError> {
        gemini::list_models(base_url, api_key).await
    }
}

impl RuntimeStateService {
    /// Runs one reconcile tick. Callers drive this periodically; two ticks of
    /// the same service must not overlap.
    pub async fn run_backend_cycle(&self, cancel: &CancellationToken) -> Result<(), StateError> {
        if cancel.is_cancelled() {
            return Err(StateError::Cancelled);
        }

        let backends = self.store.list_backends().await?;
        let declared = self.declared_model_sets(&backends).await?;

        let mut states = Vec::new();
        for backend in &backends {
            if cancel.is_cancelled() {
                return Err(StateError::Cancelled);
            }
            let Some(models) = declared.get(backend.id.as_str()) else {
                // Affinity mode: a backend in no group is not active this tick.
                continue;
            };
            let state = self.process_backend(backend, models).await;
            if let Some(err) = &state.error {
                warn!(backend = %backend.name, error = %err, "backend reconcile recorded error");
            } else {
                debug!(backend = %backend.name, pulled = state.pulled_models.len(), "backend reconciled");
            }
            states.push(Arc::new(state));
        }

        self.publish(states);
        Ok(())
    }

    /// Declared model set per active backend id. Global mode applies every
    /// model to every backend; affinity mode unions each backend's groups.
    async fn declared_model_sets(
        &self,
        backends: &[Backend],
    ) -> Result<HashMap<String, Vec<Model>>, StateError> {
        let mut declared: HashMap<String, Vec<Model>> = HashMap::new();

        if !self.options.affinity_aware {
            let models = self.store.list_models().await?;
            for backend in backends {
                declared.insert(backend.id.clone(), models.clone());
            }
            return Ok(declared);
        }

        // Union model ids per backend across all groups, then resolve each
        // model entity once.
        let mut per_backend: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for group in self.store.list_groups().await? {
            let backend_ids = self.store.list_group_backends(&group.id).await?;
            let model_ids = self.store.list_group_models(&group.id).await?;
            for backend_id in backend_ids {
                per_backend
                    .entry(backend_id)
                    .or_default()
                    .extend(model_ids.iter().cloned());
            }
        }

        for (backend_id, model_ids) in per_backend {
            let mut models = Vec::new();
            for model_id in model_ids {
                match self.store.get_model(&model_id).await {
                    Ok(model) => models.push(model),
                    Err(StoreError::NotFound) => {
                        warn!(model_id, "declared model assignment points at missing model");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            models.sort_by(|a, b| a.name.cmp(&b.name));
            declared.insert(backend_id, models);
        }
        Ok(declared)
    }

    async fn process_backend(&self, backend: &Backend, declared: &[Model]) -> BackendRuntimeState {
        let declared_names: Vec<String> = declared.iter().map(|m| m.name.clone()).collect();
        match BackendType::parse(&backend.backend_type) {
            Some(BackendType::Ollama) => self.process_ollama(backend, declared).await,
            Some(BackendType::Vllm) => self.process_vllm(backend, declared).await,
            Some(BackendType::Openai) => self.process_openai(backend, declared).await,
            Some(BackendType::Gemini) => self.process_gemini(backend, declared).await,
            None => BackendRuntimeState::errored(
                backend.clone(),
                declared_names,
                format!("Unsupported backend type: {}", backend.backend_type),
            ),
        }
    }

    async fn process_ollama(&self, backend: &Backend, declared: &[Model]) -> BackendRuntimeState {
        let declared_names: Vec<String> = declared.iter().map(|m| m.name.clone()).collect();
        let mut present = match self.probe.ollama_list(&backend.base_url).await {
            Ok(models) => models,
            Err(e) => {
                return BackendRuntimeState::errored(
                    backend.clone(),
                    declared_names,
                    format!("list models: {e}"),
                )
            }
        };
        let present_names: BTreeSet<&str> = present.iter().map(|m| m.name.as_str()).collect();

        // One download per backend per tick; the queue key (base_url) makes
        // further appends no-ops anyway.
        if let Some(missing) = declared
            .iter()
            .find(|m| !present_names.contains(m.name.as_str()))
        {
            let now = self.clock.now();
            let job = DownloadJob {
                base_url: backend.base_url.clone(),
                model_name: missing.name.clone(),
                scheduled_for: now,
                valid_until: now + Duration::hours(JOB_VALIDITY_HOURS),
                retry_count: 0,
            };
            if let Err(e) = self.store.append_download_job(job).await {
                return BackendRuntimeState::errored(
                    backend.clone(),
                    declared_names,
                    format!("queue download: {e}"),
                );
            }
            debug!(backend = %backend.name, model = %missing.name, "queued model download");
        }

        let mut mutated = false;
        if !self.options.skip_delete_undeclared {
            for observed in &present {
                if declared_names.iter().any(|n| n == &observed.name) {
                    continue;
                }
                match self.probe.ollama_delete(&backend.base_url, &observed.name).await {
                    Ok(()) => {
                        mutated = true;
                        debug!(backend = %backend.name, model = %observed.name, "deleted undeclared model");
                    }
                    Err(e) => {
                        warn!(backend = %backend.name, model = %observed.name, error = %e, "delete undeclared model failed");
                    }
                }
            }
        }

        if mutated {
            match self.probe.ollama_list(&backend.base_url).await {
                Ok(models) => present = models,
                Err(e) => {
                    return BackendRuntimeState::errored(
                        backend.clone(),
                        declared_names,
                        format!("re-list models: {e}"),
                    )
                }
            }
        }

        let pulled = declared
            .iter()
            .filter_map(|model| {
                present.iter().find(|p| p.name == model.name).map(|observed| {
                    let mut entry = PulledModel::from_declared(model);
                    entry.digest = observed.digest.clone();
                    entry
                })
            })
            .collect();

        BackendRuntimeState {
            backend: backend.clone(),
            declared_models: declared_names,
            pulled_models: pulled,
            error: None,
            api_key: None,
        }
    }

    async fn process_vllm(&self, backend: &Backend, declared: &[Model]) -> BackendRuntimeState {
        let declared_names: Vec<String> = declared.iter().map(|m| m.name.clone()).collect();
        let served = match self.probe.vllm_list(&backend.base_url).await {
            Ok(models) => models,
            Err(e) => {
                return BackendRuntimeState::errored(
                    backend.clone(),
                    declared_names,
                    format!("list served models: {e}"),
                )
            }
        };

        let Some(served_name) = served.first() else {
            return BackendRuntimeState::errored(
                backend.clone(),
                declared_names,
                "backend serves no model".to_string(),
            );
        };

        match declared.iter().find(|m| &m.name == served_name) {
            Some(model) => BackendRuntimeState {
                backend: backend.clone(),
                declared_models: declared_names,
                pulled_models: vec![PulledModel::from_declared(model)],
                error: None,
                api_key: None,
            },
            None => BackendRuntimeState::errored(
                backend.clone(),
                declared_names,
                format!("served model {served_name} not declared"),
            ),
        }
    }

    async fn api_key_for(&self, backend: &Backend, provider_type: &str) -> Result<String, String> {
        match get_provider_config(self.store.as_ref(), provider_type).await {
            Ok(Some(cfg)) => Ok(cfg.api_key),
            Ok(None) => Err(format!(
                "no API key configured for {provider_type} backend {}",
                backend.name
            )),
            Err(e) => Err(format!("read provider config: {e}")),
        }
    }

    async fn process_openai(&self, backend: &Backend, declared: &[Model]) -> BackendRuntimeState {
        let declared_names: Vec<String> = declared.iter().map(|m| m.name.clone()).collect();
        let api_key = match self.api_key_for(backend, "openai").await {
            Ok(key) => key,
            Err(e) => return BackendRuntimeState::errored(backend.clone(), declared_names, e),
        };

        let now = self.clock.now();
        let available = match self.openai_cache.get(&backend.id, &api_key, now) {
            Some(cached) => cached,
            None => match self.probe.openai_list(&backend.base_url, &api_key).await {
                Ok(models) => {
                    self.openai_cache.insert(&backend.id, &api_key, models.clone(), now);
                    models
                }
                Err(e) => {
                    return BackendRuntimeState::errored(
                        backend.clone(),
                        declared_names,
                        format!("list models: {e}"),
                    )
                }
            },
        };

        let pulled: Vec<PulledModel> = declared
            .iter()
            .filter(|m| available.iter().any(|a| a == &m.name))
            .map(PulledModel::from_declared)
            .collect();

        let error = if !declared.is_empty() && pulled.is_empty() {
            Some(format!(
                "none of the declared models [{}] are available; provider lists [{}]",
                declared_names.join(", "),
                available.join(", ")
            ))
        } else {
            None
        };

        BackendRuntimeState {
            backend: backend.clone(),
            declared_models: declared_names,
            pulled_models: pulled,
            error,
            api_key: Some(api_key),
        }
    }

    async fn process_gemini(&self, backend: &Backend, declared: &[Model]) -> BackendRuntimeState {
        let declared_names: Vec<String> = declared.iter().map(|m| m.name.clone()).collect();
        let api_key = match self.api_key_for(backend, "gemini").await {
            Ok(key) => key,
            Err(e) => return BackendRuntimeState::errored(backend.clone(), declared_names, e),
        };

        let now = self.clock.now();
        let listings = match self.gemini_cache.get(&backend.id, &api_key, now) {
            Some(cached) => cached,
            None => match self.probe.gemini_list(&backend.base_url, &api_key).await {
                Ok(listings) => {
                    self.gemini_cache.insert(&backend.id, &api_key, listings.clone(), now);
                    listings
                }
                Err(e) => {
                    return BackendRuntimeState::errored(
                        backend.clone(),
                        declared_names,
                        format!("list models: {e}"),
                    )
                }
            },
        };

        // Capabilities come from the provider listing here: Gemini reports
        // supported methods and token limits authoritatively.
        let pulled: Vec<PulledModel> = listings
            .iter()
            .filter(|l| declared_names.iter().any(|n| n == &l.name))
            .map(PulledModel::from_gemini)
            .collect();

        let error = if !declared.is_empty() && pulled.is_empty() {
            let available: Vec<&str> = listings.iter().map(|l| l.name.as_str()).collect();
            Some(format!(
                "none of the declared models [{}] are available; provider lists [{}]",
                declared_names.join(", "),
                available.join(", ")
            ))
        } else {
            None
        };

        BackendRuntimeState {
            backend: backend.clone(),
            declared_models: declared_names,
            pulled_models: pulled,
            error,
            api_key: Some(api_key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{AffinityGroup, ProviderConfig};
    use crate::state::{ReconcilerOptions, RuntimeSnapshot, SystemClock};
    use crate::store::{
        AffinityGroupStore, BackendStore, DownloadJobStore, InMemoryStore, ModelStore, Store,
    };
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockProbe {
        ollama_models: Mutex<HashMap<String, Vec<String>>>,
        vllm_models: Mutex<HashMap<String, Vec<String>>>,
        openai_models: Mutex<Vec<String>>,
        openai_calls: AtomicUsize,
        deleted: Mutex<Vec<(String, String)>>,
    }

    impl MockProbe {
        fn set_ollama(&self, url: &str, models: &[&str]) {
            self.ollama_models
                .lock()
                .unwrap()
                .insert(url.to_string(), models.iter().map(|s| s.to_string()).collect());
        }

        fn set_vllm(&self, url: &str, models: &[&str]) {
            self.vllm_models
                .lock()
                .unwrap()
                .insert(url.to_string(), models.iter().map(|s| s.to_string()).collect());
        }
    }

    #[async_trait]
    impl BackendProbe for MockProbe {
        async fn ollama_list(&self, base_url: &str) -> Result<Vec<OllamaModelSummary>, ProviderError> {
            let models = self.ollama_models.lock().unwrap();
            Ok(models
                .get(base_url)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|name| OllamaModelSummary {
                    name,
                    digest: "sha256:x".into(),
                    size: 1,
                })
                .collect())
        }

        async fn ollama_delete(&self, base_url: &str, model: &str) -> Result<(), ProviderError> {
            self.deleted
                .lock()
                .unwrap()
                .push((base_url.to_string(), model.to_string()));
            if let Some(models) = self.ollama_models.lock().unwrap().get_mut(base_url) {
                models.retain(|m| m != model);
            }
            Ok(())
        }

        async fn vllm_list(&self, base_url: &str) -> Result<Vec<String>, ProviderError> {
            Ok(self
                .vllm_models
                .lock()
                .unwrap()
                .get(base_url)
                .cloned()
                .unwrap_or_default())
        }

        async fn openai_list(&self, _base_url: &str, _api_key: &str) -> Result<Vec<String>, ProviderError> {
            self.openai_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.openai_models.lock().unwrap().clone())
        }

        async fn gemini_list(&self, _base_url: &str, _api_key: &str) -> Result<Vec<GeminiListing>, ProviderError> {
            Ok(vec![GeminiListing {
                name: "gemini-2.0-flash".into(),
                context_length: 1_000_000,
                can_chat: true,
                can_prompt: true,
                can_embed: false,
                can_stream: true,
            }])
        }
    }

    fn backend(id: &str, url: &str, backend_type: &str) -> Backend {
        let now = Utc::now();
        Backend {
            id: id.into(),
            name: format!("backend-{id}"),
            base_url: url.into(),
            backend_type: backend_type.into(),
            created_at: now,
            updated_at: now,
        }
    }

    fn model(id: &str, name: &str) -> Model {
        let now = Utc::now();
        Model {
            id: id.into(),
            name: name.into(),
            context_length: 4096,
            can_chat: true,
            can_embed: false,
            can_prompt: true,
            can_stream: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn service(
        store: Arc<InMemoryStore>,
        probe: Arc<MockProbe>,
        options: ReconcilerOptions,
    ) -> RuntimeStateService {
        RuntimeStateService::with_probe_and_clock(store, options, probe, Arc::new(SystemClock))
    }

    /// **Scenario**: declared model missing from the backend enqueues exactly
    /// one download; after the model appears, the next tick enqueues the
    /// next missing one.
    #[tokio::test]
    async fn missing_model_enqueues_one_download() {
        let store = Arc::new(InMemoryStore::new());
        let probe = Arc::new(MockProbe::default());
        probe.set_ollama("http://b", &[]);
        store.create_backend(backend("b1", "http://b", "ollama")).await.unwrap();
        store.create_model(model("m1", "alpha")).await.unwrap();
        store.create_model(model("m2", "beta")).await.unwrap();

        let svc = service(store.clone(), probe.clone(), ReconcilerOptions::default());
        svc.run_backend_cycle(&CancellationToken::new()).await.unwrap();

        let jobs = store.list_download_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].base_url, "http://b");
        assert_eq!(jobs[0].model_name, "alpha");

        // alpha arrives; next tick queues beta.
        store.delete_download_jobs("http://b").await.unwrap();
        probe.set_ollama("http://b", &["alpha"]);
        svc.run_backend_cycle(&CancellationToken::new()).await.unwrap();
        let jobs = store.list_download_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].model_name, "beta");

        let state = svc.get("b1").unwrap();
        assert_eq!(state.pulled_models.len(), 1);
        assert_eq!(state.pulled_models[0].name, "alpha");
        assert!(state.pulled_models[0].can_chat);
    }

    /// **Scenario**: present-but-undeclared models are deleted, unless the
    /// skip policy is set.
    #[tokio::test]
    async fn undeclared_models_deleted_unless_policy_skips() {
        let store = Arc::new(InMemoryStore::new());
        let probe = Arc::new(MockProbe::default());
        probe.set_ollama("http://b", &["alpha", "stray"]);
        store.create_backend(backend("b1", "http://b", "ollama")).await.unwrap();
        store.create_model(model("m1", "alpha")).await.unwrap();

        let svc = service(store.clone(), probe.clone(), ReconcilerOptions::default());
        svc.run_backend_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            probe.deleted.lock().unwrap().as_slice(),
            &[("http://b".to_string(), "stray".to_string())]
        );

        // With the policy set, nothing is deleted.
        probe.deleted.lock().unwrap().clear();
        probe.set_ollama("http://b", &["alpha", "stray"]);
        let svc = service(
            store.clone(),
            probe.clone(),
            ReconcilerOptions {
                skip_delete_undeclared: true,
                ..Default::default()
            },
        );
        svc.run_backend_cycle(&CancellationToken::new()).await.unwrap();
        assert!(probe.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn vllm_served_model_must_be_declared() {
        let store = Arc::new(InMemoryStore::new());
        let probe = Arc::new(MockProbe::default());
        probe.set_vllm("http://v", &["mystery"]);
        store.create_backend(backend("b1", "http://v", "vllm")).await.unwrap();
        store.create_model(model("m1", "alpha")).await.unwrap();

        let svc = service(store.clone(), probe, ReconcilerOptions::default());
        svc.run_backend_cycle(&CancellationToken::new()).await.unwrap();

        let state = svc.get("b1").unwrap();
        assert_eq!(
            state.error.as_deref(),
            Some("served model mystery not declared")
        );
        assert!(state.pulled_models.is_empty());
    }

    /// **Scenario**: the OpenAI listing is cached across ticks; the declared
    /// intersection becomes the pulled set.
    #[tokio::test]
    async fn openai_listing_cached_between_ticks() {
        let store = Arc::new(InMemoryStore::new());
        let probe = Arc::new(MockProbe::default());
        *probe.openai_models.lock().unwrap() = vec!["gpt-x".into(), "gpt-y".into()];
        store.create_backend(backend("b1", "https://api", "openai")).await.unwrap();
        store.create_model(model("m1", "gpt-x")).await.unwrap();
        crate::store::set_provider_config(
            store.as_ref(),
            &ProviderConfig {
                provider_type: "openai".into(),
                api_key: "sk-1".into(),
            },
        )
        .await
        .unwrap();

        let svc = service(store.clone(), probe.clone(), ReconcilerOptions::default());
        svc.run_backend_cycle(&CancellationToken::new()).await.unwrap();
        svc.run_backend_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(probe.openai_calls.load(Ordering::SeqCst), 1);

        let state = svc.get("b1").unwrap();
        assert!(state.error.is_none());
        assert_eq!(state.pulled_models.len(), 1);
        assert_eq!(state.pulled_models[0].name, "gpt-x");
        assert_eq!(state.api_key.as_deref(), Some("sk-1"));
    }

    #[tokio::test]
    async fn openai_empty_intersection_is_an_error() {
        let store = Arc::new(InMemoryStore::new());
        let probe = Arc::new(MockProbe::default());
        *probe.openai_models.lock().unwrap() = vec!["gpt-y".into()];
        store.create_backend(backend("b1", "https://api", "openai")).await.unwrap();
        store.create_model(model("m1", "gpt-x")).await.unwrap();
        crate::store::set_provider_config(
            store.as_ref(),
            &ProviderConfig {
                provider_type: "openai".into(),
                api_key: "sk-1".into(),
            },
        )
        .await
        .unwrap();

        let svc = service(store.clone(), probe, ReconcilerOptions::default());
        svc.run_backend_cycle(&CancellationToken::new()).await.unwrap();
        let state = svc.get("b1").unwrap();
        let error = state.error.as_deref().unwrap();
        assert!(error.contains("gpt-x"), "error should list declared: {error}");
        assert!(error.contains("gpt-y"), "error should list available: {error}");
    }

    #[tokio::test]
    async fn missing_api_key_recorded_not_fatal() {
        let store = Arc::new(InMemoryStore::new());
        let probe = Arc::new(MockProbe::default());
        store.create_backend(backend("b1", "https://api", "openai")).await.unwrap();

        let svc = service(store.clone(), probe, ReconcilerOptions::default());
        svc.run_backend_cycle(&CancellationToken::new()).await.unwrap();
        let state = svc.get("b1").unwrap();
        assert!(state.error.as_deref().unwrap().contains("no API key"));
    }

    #[tokio::test]
    async fn unknown_backend_type_recorded() {
        let store = Arc::new(InMemoryStore::new());
        let probe = Arc::new(MockProbe::default());
        store.create_backend(backend("b1", "http://t", "triton")).await.unwrap();

        let svc = service(store.clone(), probe, ReconcilerOptions::default());
        svc.run_backend_cycle(&CancellationToken::new()).await.unwrap();
        let state = svc.get("b1").unwrap();
        assert_eq!(
            state.error.as_deref(),
            Some("Unsupported backend type: triton")
        );
    }

    /// **Scenario**: affinity mode — a backend in two groups is processed
    /// once with the union of both groups' models; a backend in no group
    /// drops out of the snapshot.
    #[tokio::test]
    async fn affinity_union_and_cleanup() {
        let store = Arc::new(InMemoryStore::new());
        let probe = Arc::new(MockProbe::default());
        probe.set_ollama("http://b", &["alpha", "beta"]);
        probe.set_ollama("http://c", &[]);
        store.create_backend(backend("b1", "http://b", "ollama")).await.unwrap();
        store.create_backend(backend("b2", "http://c", "ollama")).await.unwrap();
        store.create_model(model("m1", "alpha")).await.unwrap();
        store.create_model(model("m2", "beta")).await.unwrap();

        let now = Utc::now();
        for (gid, mid) in [("g1", "m1"), ("g2", "m2")] {
            store
                .create_group(AffinityGroup {
                    id: gid.into(),
                    name: gid.into(),
                    purpose_type: "general".into(),
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
            store.assign_backend(gid, "b1").await.unwrap();
            store.assign_model(gid, mid).await.unwrap();
        }

        let svc = service(
            store.clone(),
            probe,
            ReconcilerOptions {
                affinity_aware: true,
                ..Default::default()
            },
        );
        svc.run_backend_cycle(&CancellationToken::new()).await.unwrap();

        let snapshot = svc.snapshot();
        assert_eq!(snapshot.len(), 1, "ungrouped backend must drop out");
        let state = &snapshot[0];
        assert_eq!(state.backend.id, "b1");
        assert_eq!(state.declared_models, vec!["alpha", "beta"]);
        assert_eq!(state.pulled_models.len(), 2);
    }

    /// **Scenario**: two ticks with unchanged inputs produce equal snapshots.
    #[tokio::test]
    async fn tick_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let probe = Arc::new(MockProbe::default());
        probe.set_ollama("http://b", &["alpha"]);
        store.create_backend(backend("b1", "http://b", "ollama")).await.unwrap();
        store.create_model(model("m1", "alpha")).await.unwrap();

        let svc = service(store.clone(), probe, ReconcilerOptions::default());
        svc.run_backend_cycle(&CancellationToken::new()).await.unwrap();
        let first = svc.snapshot();
        svc.run_backend_cycle(&CancellationToken::new()).await.unwrap();
        let second = svc.snapshot();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.backend.id, b.backend.id);
            assert_eq!(a.declared_models, b.declared_models);
            assert_eq!(a.pulled_models, b.pulled_models);
            assert_eq!(a.error, b.error);
        }
    }

    #[tokio::test]
    async fn cancelled_tick_aborts() {
        let store = Arc::new(InMemoryStore::new());
        let probe = Arc::new(MockProbe::default());
        let svc = service(store, probe, ReconcilerOptions::default());
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            svc.run_backend_cycle(&token).await,
            Err(StateError::Cancelled)
        ));
    }
}
