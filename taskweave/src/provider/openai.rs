//! OpenAI-compatible adapter: chat completions, embeddings, model listing.
//!
//! Tool-function names are sanitized to `[A-Za-z0-9_-]+` and deduplicated per
//! request; a per-request reverse map restores the original name on returned
//! tool calls so callers never observe the sanitized form.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::entities::BackendType;
use crate::history::{ChatMessage, FunctionCall, ToolCall};

use super::{cancellable, ChatArgs, ChatResult, ModelClient, ProviderError, ToolDefinition};

const LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request mapping between original and sanitized tool names.
#[derive(Debug, Default, Clone)]
pub struct ToolNameMap {
    reverse: HashMap<String, String>,
}

impl ToolNameMap {
    /// Original name for a sanitized one; unmapped names pass through.
    pub fn original(&self, sanitized: &str) -> String {
        self.reverse
            .get(sanitized)
            .cloned()
            .unwrap_or_else(|| sanitized.to_string())
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "tool".to_string()
    } else {
        cleaned
    }
}

/// Sanitizes and uniquifies tool names for one request. Returns the rewritten
/// tools plus the reverse map for the response path.
pub fn sanitize_tool_names(tools: &[ToolDefinition]) -> (Vec<ToolDefinition>, ToolNameMap) {
    let mut seen: HashMap<String, u32> = HashMap::new();
    let mut map = ToolNameMap::default();
    let rewritten = tools
        .iter()
        .map(|tool| {
            let base = sanitize_name(&tool.function.name);
            let count = seen.entry(base.clone()).or_insert(0);
            *count += 1;
            let unique = if *count == 1 {
                base
            } else {
                format!("{base}_{count}")
            };
            map.reverse.insert(unique.clone(), tool.function.name.clone());
            let mut rewritten = tool.clone();
            rewritten.function.name = unique;
            rewritten
        })
        .collect();
    (rewritten, map)
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default)]
    call_type: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireChatResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireEmbeddingData {
    embedding: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct WireEmbeddingResponse {
    data: Vec<WireEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct WireModel {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireModelList {
    #[serde(default)]
    data: Vec<WireModel>,
}

/// Lists model ids at an OpenAI-compatible `/models` endpoint.
pub async fn list_models(base_url: &str, api_key: Option<&str>) -> Result<Vec<String>, ProviderError> {
    let http = reqwest::Client::new();
    let mut request = http
        .get(format!("{base_url}/models"))
        .timeout(LIST_TIMEOUT);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }
    let resp = request.send().await?;
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

/// Chat/prompt/embed against one model behind an OpenAI-compatible API.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    context_length: u32,
    can_chat: bool,
    can_prompt: bool,
    can_embed: bool,
    can_stream: bool,
    provider_type: BackendType,
}

impl OpenAiClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
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
            api_key,
            model: model.into(),
            context_length,
            can_chat,
            can_prompt,
            can_embed,
            can_stream,
            provider_type: BackendType::Openai,
        }
    }

    /// Reports a different provider type; used by the vllm adapter which
    /// shares this wire protocol.
    pub fn with_provider_type(mut self, provider_type: BackendType) -> Self {
        self.provider_type = provider_type;
        self
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn chat_request(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        args: &ChatArgs,
    ) -> Result<(WireChatResponse, ToolNameMap), ProviderError> {
        let (wire_tools, name_map) = sanitize_tool_names(tools);

        let wire_messages: Vec<WireMessage> = messages
            .iter()
            .map(|m| WireMessage {
                role: &m.role,
                content: Some(&m.content),
                tool_call_id: m.tool_call_id.as_deref(),
                tool_calls: (!m.tool_calls.is_empty()).then(|| {
                    m.tool_calls
                        .iter()
                        .filter_map(|c| serde_json::to_value(c).ok())
                        .collect()
                }),
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": wire_messages,
        });
        if !wire_tools.is_empty() {
            body["tools"] = serde_json::to_value(&wire_tools)
                .map_err(|e| ProviderError::Decode(e.to_string()))?;
        }
        if let Some(t) = args.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = args.max_tokens {
            body["max_tokens"] = serde_json::json!(m);
        }

        let resp = self
            .authed(self.http.post(format!("{}/chat/completions", self.base_url)))
            .json(&body)
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
        let body: WireChatResponse =
            resp.json().await.map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok((body, name_map))
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_type(&self) -> BackendType {
        self.provider_type
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
            let (body, name_map) = self.chat_request(messages, tools, args).await?;
            let choice = body.choices.into_iter().next().ok_or(ProviderError::NoCandidates)?;

            let tool_calls: Vec<ToolCall> = choice
                .message
                .tool_calls
                .into_iter()
                .map(|c| ToolCall {
                    id: c.id,
                    call_type: if c.call_type.is_empty() {
                        "function".to_string()
                    } else {
                        c.call_type
                    },
                    function: FunctionCall {
                        name: name_map.original(&c.function.name),
                        arguments: c.function.arguments,
                    },
                })
                .collect();

            let content = choice.message.content.unwrap_or_default();
            if content.is_empty() && tool_calls.is_empty() {
                return Err(ProviderError::EmptyCompletion);
            }

            let mut message = ChatMessage::assistant(content);
            message.tool_calls = tool_calls;
            Ok(ChatResult {
                message,
                input_tokens: body.usage.as_ref().map(|u| u.prompt_tokens),
                output_tokens: body.usage.as_ref().map(|u| u.completion_tokens),
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
        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));
        let result = self.chat(cancel, &messages, &[], args).await?;
        Ok(result.message.content)
    }

    async fn embed(
        &self,
        cancel: &CancellationToken,
        text: &str,
    ) -> Result<Vec<f64>, ProviderError> {
        cancellable(cancel, async {
            let resp = self
                .authed(self.http.post(format!("{}/embeddings", self.base_url)))
                .json(&serde_json::json!({ "model": self.model, "input": text }))
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
            let body: WireEmbeddingResponse =
                resp.json().await.map_err(|e| ProviderError::Decode(e.to_string()))?;
            body.data
                .into_iter()
                .next()
                .map(|d| d.embedding)
                .ok_or(ProviderError::NoCandidates)
        })
        .await
    }
}
