//! Provider capability clients and the registry that resolves them.
//!
//! Every backend type is normalized behind one [`ModelClient`] trait carrying
//! chat/prompt/embed/stream plus identity metadata. The [`ProviderResolver`]
//! selects a client from the reconciler's runtime-state snapshot; it never
//! talks to the network itself.

pub mod gemini;
pub mod ollama;
pub mod openai;
mod registry;
mod tokens;
pub mod vllm;

pub use gemini::{GeminiClient, GeminiListing};
pub use ollama::{OllamaAdminApi, OllamaClient, OllamaModelSummary, PullProgress};
pub use openai::{sanitize_tool_names, OpenAiClient, ToolNameMap};
pub use registry::{ClientResolver, ProviderResolver, ResolveError, ResolveRequest, ResolvedClient};
pub use tokens::{HeuristicTokenCounter, TokenCounter};
pub use vllm::VllmClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::entities::BackendType;
use crate::history::ChatMessage;

/// Model capability a caller requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    #[default]
    Chat,
    Prompt,
    Embed,
    Stream,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Capability::Chat => "chat",
            Capability::Prompt => "prompt",
            Capability::Embed => "embed",
            Capability::Stream => "stream",
        };
        f.write_str(s)
    }
}

/// Upstream provider failure.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider returned an empty completion")]
    EmptyCompletion,
    #[error("provider returned no candidates")]
    NoCandidates,
    #[error("stream blocked by provider")]
    StreamBlocked,
    #[error("operation cancelled")]
    Cancelled,
    #[error("model {model} does not support {capability}")]
    Unsupported { model: String, capability: Capability },
    #[error("decode response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Http(e.to_string())
    }
}

/// Generation parameters shared by all providers.
#[derive(Debug, Clone, Default)]
pub struct ChatArgs {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// One completed chat turn: the assistant message plus usage when reported.
#[derive(Debug, Clone)]
pub struct ChatResult {
    pub message: ChatMessage,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

/// An LLM-visible tool, in the function-calling shape all providers accept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type", default)]
    pub tool_type: String,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolFunction {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: ToolFunction {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// A concrete model on a concrete backend. Metadata mirrors the pulled-model
/// entry the resolver selected; capability queries are local, calls go over
/// the wire.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn model_name(&self) -> &str;
    fn provider_type(&self) -> BackendType;
    fn context_length(&self) -> u32;
    fn can_chat(&self) -> bool;
    fn can_prompt(&self) -> bool;
    fn can_embed(&self) -> bool;
    fn can_stream(&self) -> bool;

    async fn chat(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        args: &ChatArgs,
    ) -> Result<ChatResult, ProviderError>;

    async fn prompt(
        &self,
        cancel: &CancellationToken,
        system: &str,
        prompt: &str,
        args: &ChatArgs,
    ) -> Result<String, ProviderError>;

    async fn embed(
        &self,
        cancel: &CancellationToken,
        text: &str,
    ) -> Result<Vec<f64>, ProviderError>;

    /// Streams content chunks through `chunk_tx` while accumulating the full
    /// result. Implementations without true streaming send one final chunk.
    async fn stream(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        args: &ChatArgs,
        chunk_tx: mpsc::Sender<String>,
    ) -> Result<ChatResult, ProviderError> {
        let result = self.chat(cancel, messages, &[], args).await?;
        if !result.message.content.is_empty() {
            let _ = chunk_tx.send(result.message.content.clone()).await;
        }
        Ok(result)
    }
}

/// Runs `fut` unless the token fires first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        result = fut => result,
    }
}
