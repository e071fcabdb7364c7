//! Ollama adapter: chat/generate/embed plus the management API the
//! reconciler and download orchestrator drive (list/pull/delete).

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::entities::BackendType;
use crate::history::{ChatMessage, FunctionCall, ToolCall};

use super::{cancellable, ChatArgs, ChatResult, ModelClient, ProviderError, ToolDefinition};

const LIST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaFunction {
    name: String,
    arguments: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f64>>,
}

fn to_wire(messages: &[ChatMessage]) -> Vec<OllamaMessage> {
    messages
        .iter()
        .map(|m| OllamaMessage {
            role: m.role.clone(),
            content: m.content.clone(),
            tool_calls: (!m.tool_calls.is_empty()).then(|| {
                m.tool_calls
                    .iter()
                    .map(|c| OllamaToolCall {
                        function: OllamaFunction {
                            name: c.function.name.clone(),
                            arguments: serde_json::from_str(&c.function.arguments)
                                .unwrap_or(serde_json::Value::Null),
                        },
                    })
                    .collect()
            }),
        })
        .collect()
}

fn from_wire_calls(calls: Option<Vec<OllamaToolCall>>) -> Vec<ToolCall> {
    calls
        .unwrap_or_default()
        .into_iter()
        .map(|c| ToolCall {
            // Ollama does not assign call ids; generate one so tool messages
            // can still correlate.
            id: format!("call_{}", Uuid::new_v4().simple()),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: c.function.name,
                arguments: c.function.arguments.to_string(),
            },
        })
        .collect()
}

/// Chat/prompt/embed against one model served by an ollama backend.
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    context_length: u32,
    can_chat: bool,
    can_prompt: bool,
    can_embed: bool,
    can_stream: bool,
}

impl OllamaClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        context_length: u32,
        can_chat: bool,
        can_prompt: bool,
        can_embed: bool,
        can_stream: bool,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            context_length,
            can_chat,
            can_prompt,
            can_embed,
            can_stream,
        }
    }

    async fn post_chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        args: &ChatArgs,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = OllamaChatRequest {
            model: &self.model,
            messages: to_wire(messages),
            stream,
            tools: (!tools.is_empty()).then(|| {
                tools
                    .iter()
                    .filter_map(|t| serde_json::to_value(t).ok())
                    .collect()
            }),
            options: Some(OllamaOptions {
                temperature: args.temperature,
                num_predict: args.max_tokens,
            }),
        };
        let resp = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await?;
        error_for_status(resp).await
    }
}

async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ModelClient for OllamaClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_type(&self) -> BackendType {
        BackendType::Ollama
    }

    fn context_length(&self) -> u32 {
        self.context_length
    }

    fn can_chat(&self) -> bool {
        self.can_chat
    }

    fn can_prompt(&self) -> bool {
        self.can_prompt
    }

    fn can_embed(&self) -> bool {
        self.can_embed
    }

    fn can_stream(&self) -> bool {
        self.can_stream
    }

    async fn chat(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        args: &ChatArgs,
    ) -> Result<ChatResult, ProviderError> {
        cancellable(cancel, async {
            let resp = self.post_chat(messages, tools, args, false).await?;
            let body: OllamaChatResponse =
                resp.json().await.map_err(|e| ProviderError::Decode(e.to_string()))?;
            let tool_calls = from_wire_calls(body.message.tool_calls);
            if body.message.content.is_empty() && tool_calls.is_empty() {
                return Err(ProviderError::EmptyCompletion);
            }
            let mut message = ChatMessage::assistant(body.message.content);
            message.tool_calls = tool_calls;
            Ok(ChatResult {
                message,
                input_tokens: body.prompt_eval_count,
                output_tokens: body.eval_count,
            })
        })
        .await
    }

    async fn prompt(
        &self,
        cancel: &CancellationToken,
        system: &str,
        prompt: &str,
        args: &ChatArgs,
    ) -> Result<String, ProviderError> {
        cancellable(cancel, async {
            let body = OllamaGenerateRequest {
                model: &self.model,
                prompt,
                system,
                stream: false,
                options: Some(OllamaOptions {
                    temperature: args.temperature,
                    num_predict: args.max_tokens,
                }),
            };
            let resp = self
                .http
                .post(format!("{}/api/generate", self.base_url))
                .json(&body)
                .send()
                .await?;
            let resp = error_for_status(resp).await?;
            let body: OllamaGenerateResponse =
                resp.json().await.map_err(|e| ProviderError::Decode(e.to_string()))?;
            if body.response.is_empty() {
                return Err(ProviderError::EmptyCompletion);
            }
            Ok(body.response)
        })
        .await
    }

    async fn embed(
        &self,
        cancel: &CancellationToken,
        text: &str,
    ) -> Result<Vec<f64>, ProviderError> {
        cancellable(cancel, async {
            let body = OllamaEmbedRequest {
                model: &self.model,
                input: text,
            };
            let resp = self
                .http
                .post(format!("{}/api/embed", self.base_url))
                .json(&body)
                .send()
                .await?;
            let resp = error_for_status(resp).await?;
            let body: OllamaEmbedResponse =
                resp.json().await.map_err(|e| ProviderError::Decode(e.to_string()))?;
            body.embeddings
                .into_iter()
                .next()
                .ok_or(ProviderError::NoCandidates)
        })
        .await
    }

    async fn stream(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
        args: &ChatArgs,
        chunk_tx: mpsc::Sender<String>,
    ) -> Result<ChatResult, ProviderError> {
        cancellable(cancel, async {
            let resp = self.post_chat(messages, &[], args, true).await?;
            let mut stream = resp.bytes_stream();
            let mut buffer = Vec::new();
            let mut content = String::new();
            let mut input_tokens = None;
            let mut output_tokens = None;

            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let part: OllamaChatResponse = serde_json::from_str(line)
                        .map_err(|e| ProviderError::Decode(e.to_string()))?;
                    if !part.message.content.is_empty() {
                        content.push_str(&part.message.content);
                        let _ = chunk_tx.send(part.message.content).await;
                    }
                    if part.done {
                        input_tokens = part.prompt_eval_count;
                        output_tokens = part.eval_count;
                    }
                }
            }

            if content.is_empty() {
                return Err(ProviderError::EmptyCompletion);
            }
            Ok(ChatResult {
                message: ChatMessage::assistant(content),
                input_tokens,
                output_tokens,
            })
        })
        .await
    }
}

// --- management API ---------------------------------------------------------

/// A model present on an ollama backend, as reported by `/api/tags`.
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaModelSummary {
    pub name: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModelSummary>,
}

/// One progress line of a streaming pull.
#[derive(Debug, Clone, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub completed: u64,
}

/// Management operations the reconciler and download orchestrator use.
pub struct OllamaAdminApi {
    http: reqwest::Client,
    base_url: String,
}

impl OllamaAdminApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn list_models(&self) -> Result<Vec<OllamaModelSummary>, ProviderError> {
        let resp = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(LIST_TIMEOUT)
            .send()
            .await?;
        let resp = error_for_status(resp).await?;
        let body: OllamaTagsResponse =
            resp.json().await.map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(body.models)
    }

    /// Pulls a model, reporting each progress line through `on_progress`.
    /// Honors cancellation between lines; the partial pull stays resumable
    /// on the backend side.
    pub async fn pull_model(
        &self,
        cancel: &CancellationToken,
        model: &str,
        mut on_progress: impl FnMut(PullProgress) + Send,
    ) -> Result<(), ProviderError> {
        let resp = self
            .http
            .post(format!("{}/api/pull", self.base_url))
            .json(&serde_json::json!({ "model": model, "stream": true }))
            .send()
            .await?;
        let resp = error_for_status(resp).await?;
        let mut stream = resp.bytes_stream();
        let mut buffer = Vec::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Ok(progress) = serde_json::from_str::<PullProgress>(line) {
                    on_progress(progress);
                }
            }
        }
        Ok(())
    }

    pub async fn delete_model(&self, model: &str) -> Result<(), ProviderError> {
        let resp = self
            .http
            .delete(format!("{}/api/delete", self.base_url))
            .timeout(LIST_TIMEOUT)
            .json(&serde_json::json!({ "model": model }))
            .send()
            .await?;
        error_for_status(resp).await.map(|_| ())
    }
}
