//! Gemini adapter: `generateContent`/`embedContent` plus the model listing
//! the reconciler uses to derive capabilities.
//!
//! Auth is the `X-Goog-Api-Key` header. Capabilities come from
//! `supportedGenerationMethods` (`generateContent` ⇒ chat/prompt/stream,
//! `embedContent` ⇒ embed) and context length from `inputTokenLimit`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::entities::BackendType;
use crate::history::{ChatMessage, FunctionCall, ToolCall, ROLE_ASSISTANT, ROLE_SYSTEM};

use super::{cancellable, ChatArgs, ChatResult, ModelClient, ProviderError, ToolDefinition};

const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const API_KEY_HEADER: &str = "X-Goog-Api-Key";

#[derive(Debug, Deserialize)]
struct WirePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "functionCall")]
    function_call: Option<WireFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireContent>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default, rename = "promptTokenCount")]
    prompt_token_count: u32,
    #[serde(default, rename = "candidatesTokenCount")]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct WirePromptFeedback {
    #[serde(default, rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireGenerateResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<WireUsage>,
    #[serde(default, rename = "promptFeedback")]
    prompt_feedback: Option<WirePromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct WireEmbedding {
    values: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct WireEmbedResponse {
    embedding: WireEmbedding,
}

#[derive(Debug, Deserialize)]
struct WireModelEntry {
    /// Fully qualified, e.g. `models/gemini-2.0-flash`.
    name: String,
    #[serde(default, rename = "inputTokenLimit")]
    input_token_limit: u32,
    #[serde(default, rename = "supportedGenerationMethods")]
    supported_generation_methods: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireModelListResponse {
    #[serde(default)]
    models: Vec<WireModelEntry>,
}

/// One model as observed at `/v1beta/models`, with derived capabilities.
#[derive(Debug, Clone)]
pub struct GeminiListing {
    pub name: String,
    pub context_length: u32,
    pub can_chat: bool,
    pub can_prompt: bool,
    pub can_embed: bool,
    pub can_stream: bool,
}

/// Fetches the model listing and derives capabilities per model.
pub async fn list_models(base_url: &str, api_key: &str) -> Result<Vec<GeminiListing>, ProviderError> {
    let http = reqwest::Client::new();
    let resp = http
        .get(format!("{base_url}/v1beta/models"))
        .header(API_KEY_HEADER, api_key)
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
    let body: WireModelListResponse =
        resp.json().await.map_err(|e| ProviderError::Decode(e.to_string()))?;
    Ok(body.models.into_iter().map(derive_listing).collect())
}

fn derive_listing(entry: WireModelEntry) -> GeminiListing {
    let generates = entry
        .supported_generation_methods
        .iter()
        .any(|m| m == "generateContent");
    let embeds = entry
        .supported_generation_methods
        .iter()
        .any(|m| m == "embedContent");
    GeminiListing {
        name: entry
            .name
            .strip_prefix("models/")
            .unwrap_or(&entry.name)
            .to_string(),
        context_length: entry.input_token_limit,
        can_chat: generates,
        can_prompt: generates,
        can_stream: generates,
        can_embed: embeds,
    }
}

/// Client for one Gemini model.
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    context_length: u32,
    can_chat: bool,
    can_prompt: bool,
    can_embed: bool,
    can_stream: bool,
}

impl GeminiClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
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
            api_key: api_key.into(),
            model: model.into(),
            context_length,
            can_chat,
            can_prompt,
            can_embed,
            can_stream,
        }
    }

    fn build_contents(messages: &[ChatMessage]) -> (Option<serde_json::Value>, Vec<serde_json::Value>) {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();
        for message in messages {
            if message.role == ROLE_SYSTEM {
                system_parts.push(serde_json::json!({ "text": message.content }));
                continue;
            }
            let role = if message.role == ROLE_ASSISTANT { "model" } else { "user" };
            contents.push(serde_json::json!({
                "role": role,
                "parts": [{ "text": message.content }],
            }));
        }
        let system = (!system_parts.is_empty())
            .then(|| serde_json::json!({ "parts": system_parts }));
        (system, contents)
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        args: &ChatArgs,
    ) -> Result<ChatResult, ProviderError> {
        let (system, contents) = Self::build_contents(messages);
        let mut body = serde_json::json!({ "contents": contents });
        if let Some(system) = system {
            body["systemInstruction"] = system;
        }
        if !tools.is_empty() {
            let declarations: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.function.name,
                        "description": t.function.description,
                        "parameters": t.function.parameters,
                    })
                })
                .collect();
            body["tools"] = serde_json::json!([{ "functionDeclarations": declarations }]);
        }
        if let Some(t) = args.temperature {
            body["generationConfig"] = serde_json::json!({ "temperature": t });
        }

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let resp = self
            .http
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
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
        let body: WireGenerateResponse =
            resp.json().await.map_err(|e| ProviderError::Decode(e.to_string()))?;

        if let Some(feedback) = &body.prompt_feedback {
            if feedback.block_reason.is_some() {
                return Err(ProviderError::StreamBlocked);
            }
        }

        let candidate = body.candidates.into_iter().next().ok_or(ProviderError::NoCandidates)?;
        let parts = candidate.content.map(|c| c.parts).unwrap_or_default();

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for part in parts {
            if let Some(t) = part.text {
                text.push_str(&t);
            }
            if let Some(call) = part.function_call {
                tool_calls.push(ToolCall {
                    id: format!("call_{}", Uuid::new_v4().simple()),
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name: call.name,
                        arguments: call.args.to_string(),
                    },
                });
            }
        }

        if text.is_empty() && tool_calls.is_empty() {
            return Err(ProviderError::EmptyCompletion);
        }

        let mut message = ChatMessage::assistant(text);
        message.tool_calls = tool_calls;
        Ok(ChatResult {
            message,
            input_tokens: body.usage_metadata.as_ref().map(|u| u.prompt_token_count),
            output_tokens: body.usage_metadata.as_ref().map(|u| u.candidates_token_count),
        })
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_type(&self) -> BackendType {
        BackendType::Gemini
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
        cancellable(cancel, self.generate(messages, tools, args)).await
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
            let url = format!("{}/v1beta/models/{}:embedContent", self.base_url, self.model);
            let resp = self
                .http
                .post(url)
                .header(API_KEY_HEADER, &self.api_key)
                .json(&serde_json::json!({
                    "content": { "parts": [{ "text": text }] }
                }))
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
            let body: WireEmbedResponse =
                resp.json().await.map_err(|e| ProviderError::Decode(e.to_string()))?;
            Ok(body.embedding.values)
        })
        .await
    }
}
