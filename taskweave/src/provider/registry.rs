//! Provider resolution: pick a concrete model client from the runtime-state
//! snapshot. Pure selection; no network I/O.

use std::sync::Arc;

use thiserror::Error;

use crate::entities::BackendType;
use crate::state::{BackendRuntimeState, PulledModel, RuntimeSnapshot};

use super::{Capability, GeminiClient, ModelClient, OllamaClient, OpenAiClient, VllmClient};

/// Logical client request.
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    /// Acceptable provider types; empty means any.
    pub provider_types: Vec<String>,
    /// Acceptable model names; empty means any.
    pub model_names: Vec<String>,
    pub capability: Capability,
    /// Minimum context length; 0 disables the check.
    pub min_context_length: u32,
}

/// A resolved client plus the metadata selection was based on.
#[derive(Clone)]
pub struct ResolvedClient {
    pub client: Arc<dyn ModelClient>,
    pub model_name: String,
    pub provider_type: BackendType,
    pub context_length: u32,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no provider available for the request")]
    NoProviderAvailable,
    #[error("model {model} does not support {capability}")]
    CapabilityUnsupported { model: String, capability: Capability },
}

fn has_capability(model: &PulledModel, capability: Capability) -> bool {
    match capability {
        Capability::Chat => model.can_chat,
        Capability::Prompt => model.can_prompt,
        Capability::Embed => model.can_embed,
        Capability::Stream => model.can_stream,
    }
}

/// Resolution seam consumed by the task executor; implemented by
/// [`ProviderResolver`] and by test doubles.
pub trait ClientResolver: Send + Sync {
    fn resolve(&self, request: &ResolveRequest) -> Result<ResolvedClient, ResolveError>;
}

/// Selects model clients from the latest reconciler snapshot.
pub struct ProviderResolver {
    state: Arc<dyn RuntimeSnapshot>,
}

impl ClientResolver for ProviderResolver {
    fn resolve(&self, request: &ResolveRequest) -> Result<ResolvedClient, ResolveError> {
        ProviderResolver::resolve(self, request)
    }
}

impl ProviderResolver {
    pub fn new(state: Arc<dyn RuntimeSnapshot>) -> Self {
        Self { state }
    }

    /// First match wins: backends in enumeration order, then models in the
    /// order the backend state lists them.
    pub fn resolve(&self, request: &ResolveRequest) -> Result<ResolvedClient, ResolveError> {
        let mut named_without_capability: Option<String> = None;

        for state in self.state.snapshot() {
            let Some(backend_type) = BackendType::parse(&state.backend.backend_type) else {
                continue;
            };
            if !request.provider_types.is_empty()
                && !request
                    .provider_types
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(backend_type.as_str()))
            {
                continue;
            }

            for model in &state.pulled_models {
                let name_matches = request.model_names.is_empty()
                    || request.model_names.iter().any(|n| n == &model.name);
                if !name_matches {
                    continue;
                }
                if !has_capability(model, request.capability) {
                    if !request.model_names.is_empty() {
                        named_without_capability.get_or_insert_with(|| model.name.clone());
                    }
                    continue;
                }
                if request.min_context_length > 0
                    && model.context_length < request.min_context_length
                {
                    continue;
                }
                let client = build_client(backend_type, &state, model);
                return Ok(ResolvedClient {
                    model_name: model.name.clone(),
                    provider_type: backend_type,
                    context_length: model.context_length,
                    client,
                });
            }
        }

        match named_without_capability {
            Some(model) => Err(ResolveError::CapabilityUnsupported {
                model,
                capability: request.capability,
            }),
            None => Err(ResolveError::NoProviderAvailable),
        }
    }
}

fn build_client(
    backend_type: BackendType,
    state: &BackendRuntimeState,
    model: &PulledModel,
) -> Arc<dyn ModelClient> {
    let base_url = state.backend.base_url.as_str();
    match backend_type {
        BackendType::Ollama => Arc::new(OllamaClient::new(
            base_url,
            &model.name,
            model.context_length,
            model.can_chat,
            model.can_prompt,
            model.can_embed,
            model.can_stream,
        )),
        BackendType::Vllm => Arc::new(VllmClient::new(
            base_url,
            &model.name,
            model.context_length,
            model.can_chat,
            model.can_prompt,
            model.can_embed,
            model.can_stream,
        )),
        BackendType::Openai => Arc::new(OpenAiClient::new(
            base_url,
            state.api_key.clone(),
            &model.name,
            model.context_length,
            model.can_chat,
            model.can_prompt,
            model.can_embed,
            model.can_stream,
        )),
        BackendType::Gemini => Arc::new(GeminiClient::new(
            base_url,
            state.api_key.clone().unwrap_or_default(),
            &model.name,
            model.context_length,
            model.can_chat,
            model.can_prompt,
            model.can_embed,
            model.can_stream,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct FixedSnapshot(Vec<Arc<BackendRuntimeState>>);

    impl RuntimeSnapshot for FixedSnapshot {
        fn snapshot(&self) -> Vec<Arc<BackendRuntimeState>> {
            self.0.clone()
        }
    }

    fn pulled(name: &str, ctx: u32, chat: bool, embed: bool) -> PulledModel {
        PulledModel {
            name: name.into(),
            context_length: ctx,
            can_chat: chat,
            can_prompt: chat,
            can_embed: embed,
            can_stream: chat,
            digest: String::new(),
        }
    }

    fn state(id: &str, backend_type: &str, models: Vec<PulledModel>) -> Arc<BackendRuntimeState> {
        let now = Utc::now();
        Arc::new(BackendRuntimeState {
            backend: crate::entities::Backend {
                id: id.into(),
                name: id.into(),
                base_url: format!("http://{id}"),
                backend_type: backend_type.into(),
                created_at: now,
                updated_at: now,
            },
            declared_models: models.iter().map(|m| m.name.clone()).collect(),
            pulled_models: models,
            error: None,
            api_key: None,
        })
    }

    fn request(capability: Capability) -> ResolveRequest {
        ResolveRequest {
            provider_types: vec![],
            model_names: vec![],
            capability,
            min_context_length: 0,
        }
    }

    /// **Scenario**: tie-break by backend enumeration order, then model order.
    #[test]
    fn first_match_wins_in_order() {
        let resolver = ProviderResolver::new(Arc::new(FixedSnapshot(vec![
            state("b1", "ollama", vec![pulled("m1", 4096, true, false), pulled("m2", 4096, true, false)]),
            state("b2", "ollama", vec![pulled("m3", 4096, true, false)]),
        ])));
        let resolved = resolver.resolve(&request(Capability::Chat)).unwrap();
        assert_eq!(resolved.model_name, "m1");
        assert_eq!(resolved.provider_type, BackendType::Ollama);
    }

    #[test]
    fn provider_type_filter_applies() {
        let resolver = ProviderResolver::new(Arc::new(FixedSnapshot(vec![
            state("b1", "ollama", vec![pulled("m1", 4096, true, false)]),
            state("b2", "vllm", vec![pulled("m2", 4096, true, false)]),
        ])));
        let mut req = request(Capability::Chat);
        req.provider_types = vec!["vllm".into()];
        let resolved = resolver.resolve(&req).unwrap();
        assert_eq!(resolved.model_name, "m2");
        assert_eq!(resolved.provider_type, BackendType::Vllm);
    }

    #[test]
    fn min_context_length_filters_models() {
        let resolver = ProviderResolver::new(Arc::new(FixedSnapshot(vec![state(
            "b1",
            "ollama",
            vec![pulled("small", 2048, true, false), pulled("big", 32768, true, false)],
        )])));
        let mut req = request(Capability::Chat);
        req.min_context_length = 8000;
        let resolved = resolver.resolve(&req).unwrap();
        assert_eq!(resolved.model_name, "big");
    }

    /// **Scenario**: a named model that exists but lacks the capability fails
    /// with `CapabilityUnsupported`, not `NoProviderAvailable`.
    #[test]
    fn named_model_without_capability() {
        let resolver = ProviderResolver::new(Arc::new(FixedSnapshot(vec![state(
            "b1",
            "ollama",
            vec![pulled("chat-only", 4096, true, false)],
        )])));
        let mut req = request(Capability::Embed);
        req.model_names = vec!["chat-only".into()];
        match resolver.resolve(&req) {
            Err(ResolveError::CapabilityUnsupported { model, capability }) => {
                assert_eq!(model, "chat-only");
                assert_eq!(capability, Capability::Embed);
            }
            other => panic!("expected CapabilityUnsupported, got {:?}", other.err()),
        }
    }

    #[test]
    fn empty_snapshot_is_no_provider() {
        let resolver = ProviderResolver::new(Arc::new(FixedSnapshot(vec![])));
        assert!(matches!(
            resolver.resolve(&request(Capability::Chat)),
            Err(ResolveError::NoProviderAvailable)
        ));
    }
}
