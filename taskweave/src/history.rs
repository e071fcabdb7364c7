//! Chat history and the OpenAI-shaped request/response conversions.
//!
//! The internal [`ChatHistory`] is what chat tasks mutate; the OpenAI shapes
//! exist so chains can accept and return OpenAI-compatible payloads. The
//! conversions preserve message role, content, and tool-call ids both ways.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ROLE_SYSTEM: &str = "system";
pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";
pub const ROLE_TOOL: &str = "tool";

/// One tool invocation requested by the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    /// Always `"function"` today.
    #[serde(rename = "type", default)]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON string, exactly as the provider returned it.
    pub arguments: String,
}

/// One message of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    /// Set on `tool` messages: the id of the originating assistant tool call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(ROLE_SYSTEM, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(ROLE_USER, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(ROLE_ASSISTANT, content)
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        let mut msg = Self::with_role(ROLE_TOOL, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }
}

/// Ordered conversation plus cached token accounting. Never shared across
/// chain executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatHistory {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Trusted when both counts are positive; otherwise the executor re-counts.
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

impl ChatHistory {
    pub fn last_assistant(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.role == ROLE_ASSISTANT)
    }
}

// --- OpenAI wire shapes -----------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenAiChatRequest {
    #[serde(default)]
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiChoice {
    pub index: u32,
    pub message: OpenAiMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiChatResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<OpenAiChoice>,
    pub usage: OpenAiUsage,
}

/// Converts an OpenAI request into the internal history. Message order, roles,
/// content, and tool-call ids are preserved; timestamps are assigned now.
pub fn history_from_openai(request: &OpenAiChatRequest) -> ChatHistory {
    let messages = request
        .messages
        .iter()
        .map(|m| ChatMessage {
            role: m.role.clone(),
            content: m.content.clone().unwrap_or_default(),
            tool_call_id: m.tool_call_id.clone(),
            tool_calls: m.tool_calls.clone(),
            timestamp: Utc::now(),
        })
        .collect();
    ChatHistory {
        messages,
        model: (!request.model.is_empty()).then(|| request.model.clone()),
        input_tokens: 0,
        output_tokens: 0,
    }
}

/// Converts the internal history into an OpenAI request body.
pub fn history_to_openai(history: &ChatHistory) -> OpenAiChatRequest {
    OpenAiChatRequest {
        model: history.model.clone().unwrap_or_default(),
        messages: history
            .messages
            .iter()
            .map(|m| OpenAiMessage {
                role: m.role.clone(),
                content: Some(m.content.clone()),
                tool_call_id: m.tool_call_id.clone(),
                tool_calls: m.tool_calls.clone(),
            })
            .collect(),
        temperature: None,
    }
}

/// Wraps the final assistant turn of a history into an OpenAI-shaped
/// chat-completion response.
pub fn history_to_openai_response(history: &ChatHistory, id: String) -> OpenAiChatResponse {
    let message = history
        .last_assistant()
        .map(|m| OpenAiMessage {
            role: m.role.clone(),
            content: Some(m.content.clone()),
            tool_call_id: None,
            tool_calls: m.tool_calls.clone(),
        })
        .unwrap_or(OpenAiMessage {
            role: ROLE_ASSISTANT.to_string(),
            content: Some(String::new()),
            tool_call_id: None,
            tool_calls: Vec::new(),
        });
    let finish_reason = if message.tool_calls.is_empty() {
        "stop".to_string()
    } else {
        "tool_calls".to_string()
    };
    OpenAiChatResponse {
        id,
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: history.model.clone().unwrap_or_default(),
        choices: vec![OpenAiChoice {
            index: 0,
            message,
            finish_reason,
        }],
        usage: OpenAiUsage {
            prompt_tokens: history.input_tokens,
            completion_tokens: history.output_tokens,
            total_tokens: history.input_tokens + history.output_tokens,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_history() -> ChatHistory {
        let mut history = ChatHistory::default();
        history.model = Some("m1".into());
        history.messages.push(ChatMessage::system("be brief"));
        history.messages.push(ChatMessage::user("hi"));
        let mut assistant = ChatMessage::assistant("calling a tool");
        assistant.tool_calls.push(ToolCall {
            id: "call_1".into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: "print".into(),
                arguments: r#"{"message":"ok"}"#.into(),
            },
        });
        history.messages.push(assistant);
        history.messages.push(ChatMessage::tool("ok", "call_1"));
        history
    }

    /// **Scenario**: history → OpenAI request → history preserves roles,
    /// content, and tool-call ids.
    #[test]
    fn openai_roundtrip_preserves_messages() {
        let history = sample_history();
        let request = history_to_openai(&history);
        let back = history_from_openai(&request);

        assert_eq!(back.messages.len(), history.messages.len());
        for (a, b) in history.messages.iter().zip(back.messages.iter()) {
            assert_eq!(a.role, b.role);
            assert_eq!(a.content, b.content);
            assert_eq!(a.tool_call_id, b.tool_call_id);
            assert_eq!(a.tool_calls, b.tool_calls);
        }
        assert_eq!(back.model.as_deref(), Some("m1"));
    }

    #[test]
    fn last_assistant_skips_tool_messages() {
        let history = sample_history();
        let last = history.last_assistant().unwrap();
        assert_eq!(last.content, "calling a tool");
    }

    /// **Scenario**: the response wrapper reports `tool_calls` as the finish
    /// reason when the final assistant turn requested tools.
    #[test]
    fn response_finish_reason_reflects_tool_calls() {
        let history = sample_history();
        let resp = history_to_openai_response(&history, "resp-1".into());
        assert_eq!(resp.choices.len(), 1);
        assert_eq!(resp.choices[0].finish_reason, "tool_calls");
        assert_eq!(resp.object, "chat.completion");
    }

    #[test]
    fn response_usage_carries_cached_counts() {
        let mut history = sample_history();
        history.input_tokens = 10;
        history.output_tokens = 5;
        let resp = history_to_openai_response(&history, "resp-2".into());
        assert_eq!(resp.usage.total_tokens, 15);
    }

    #[test]
    fn empty_history_yields_empty_assistant_message() {
        let resp = history_to_openai_response(&ChatHistory::default(), "r".into());
        assert_eq!(resp.choices[0].message.role, ROLE_ASSISTANT);
        assert_eq!(resp.choices[0].finish_reason, "stop");
    }
}
