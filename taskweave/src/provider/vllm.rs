//! vLLM adapter: OpenAI-compatible wire protocol around a single served model.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::entities::BackendType;
use crate::history::ChatMessage;

use super::openai::OpenAiClient;
use super::{ChatArgs, ChatResult, ModelClient, ProviderError, ToolDefinition};

const LIST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct WireModel {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireModelList {
    #[serde(default)]
    data: Vec<WireModel>,
}

/// Lists the models a vLLM instance serves via `GET /v1/models`. A standard
/// deployment serves exactly one.
pub async fn list_served_models(base_url: &str) -> Result<Vec<String>, ProviderError> {
    let http = reqwest::Client::new();
    let resp = http
        .get(format!("{base_url}/v1/models"))
        .timeout(LIST_TIMEOUT)
        .send()
        .await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ProviderError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let body: WireModelList = resp.json().await.map_err(|e| ProviderError::Decode(e.to_string()))?;
    Ok(body.data.into_iter().map(|m| m.id).collect())
}

/// Client for the single model a vLLM backend serves. Delegates to the
/// OpenAI-compatible adapter with the `/v1` path prefix applied.
pub struct VllmClient {
    inner: OpenAiClient,
}

impl VllmClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        context_length: u32,
        can_chat: bool,
        can_prompt: bool,
        can_embed: bool,
        can_stream: bool,
    ) -> Self {
        let inner = OpenAiClient::new(
            format!("{}/v1", base_url.trim_end_matches('/')),
            None,
            model,
            context_length,
            can_chat,
            can_prompt,
            can_embed,
            can_stream,
        )
        .with_provider_type(BackendType::Vllm);
        Self { inner }
    }
}

#[async_trait]
impl ModelClient for VllmClient {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn provider_type(&self) -> BackendType {
        BackendType::Vllm
    }

    fn context_length(&self) -> u32 {
        self.inner.context_length()
    }

    fn can_chat(&self) -> bool {
        self.inner.can_chat()
    }

    fn can_prompt(&self) -> bool {
        self.inner.can_prompt()
    }

    fn can_embed(&self) -> bool {
        self.inner.can_embed()
    }

    fn can_stream(&self) -> bool {
        self.inner.can_stream()
    }

    async fn chat(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        args: &ChatArgs,
    ) -> Result<ChatResult, ProviderError> {
        self.inner.chat(cancel, messages, tools, args).await
    }

    async fn prompt(
        &self,
        cancel: &CancellationToken,
        system: &str,
        prompt: &str,
        args: &ChatArgs,
    ) -> Result<String, ProviderError> {
        self.inner.prompt(cancel, system, prompt, args).await
    }

    async fn embed(
        &self,
        cancel: &CancellationToken,
        text: &str,
    ) -> Result<Vec<f64>, ProviderError> {
        self.inner.embed(cancel, text).await
    }

    async fn stream(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        args: &ChatArgs,
        chunk_tx: mpsc::Sender<String>,
    ) -> Result<ChatResult, ProviderError> {
        self.inner.stream(cancel, messages, args, chunk_tx).await
    }
}
