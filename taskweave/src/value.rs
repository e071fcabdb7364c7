//! The variant value type that flows between tasks.
//!
//! Every task input and output is a [`TypedValue`]: a JSON value paired with
//! the semantic [`DataType`] the producing handler assigned. Handlers match on
//! the data type instead of probing the JSON shape, which keeps the
//! handler-type mismatch errors explicit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::history::{ChatHistory, OpenAiChatRequest, OpenAiChatResponse};

/// Semantic type tag carried next to every value in the chain variable map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Int,
    Float,
    Bool,
    Json,
    /// Embedding vector (`Vec<f64>`).
    Vector,
    ChatHistory,
    OpenaiChat,
    OpenaiChatResponse,
    SearchResults,
    Any,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Bool => "bool",
            DataType::Json => "json",
            DataType::Vector => "vector",
            DataType::ChatHistory => "chat_history",
            DataType::OpenaiChat => "openai_chat",
            DataType::OpenaiChatResponse => "openai_chat_response",
            DataType::SearchResults => "search_results",
            DataType::Any => "any",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value plus its semantic type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypedValue {
    pub value: Value,
    pub data_type: DataType,
}

impl TypedValue {
    pub fn new(value: Value, data_type: DataType) -> Self {
        Self { value, data_type }
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::new(Value::String(s.into()), DataType::String)
    }

    pub fn int(i: i64) -> Self {
        Self::new(Value::from(i), DataType::Int)
    }

    pub fn float(f: f64) -> Self {
        Self::new(Value::from(f), DataType::Float)
    }

    pub fn bool(b: bool) -> Self {
        Self::new(Value::Bool(b), DataType::Bool)
    }

    pub fn json(v: Value) -> Self {
        Self::new(v, DataType::Json)
    }

    pub fn vector(v: Vec<f64>) -> Self {
        Self::new(Value::from(v), DataType::Vector)
    }

    pub fn chat_history(history: &ChatHistory) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            serde_json::to_value(history)?,
            DataType::ChatHistory,
        ))
    }

    pub fn openai_chat(request: &OpenAiChatRequest) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_value(request)?, DataType::OpenaiChat))
    }

    pub fn openai_chat_response(resp: &OpenAiChatResponse) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            serde_json::to_value(resp)?,
            DataType::OpenaiChatResponse,
        ))
    }

    /// Decodes the value back into a chat history. Fails when the data type
    /// disagrees or the JSON no longer matches the shape.
    pub fn as_chat_history(&self) -> Option<ChatHistory> {
        if self.data_type != DataType::ChatHistory {
            return None;
        }
        serde_json::from_value(self.value.clone()).ok()
    }

    pub fn as_openai_chat(&self) -> Option<OpenAiChatRequest> {
        if self.data_type != DataType::OpenaiChat {
            return None;
        }
        serde_json::from_value(self.value.clone()).ok()
    }

    /// The string form handlers feed to prompts: plain for scalars, the last
    /// message content for chat shapes, compact JSON otherwise.
    pub fn render_string(&self) -> Option<String> {
        match self.data_type {
            DataType::String => self.value.as_str().map(str::to_string),
            DataType::Int | DataType::Float | DataType::Bool => Some(self.value.to_string()),
            DataType::ChatHistory => self
                .as_chat_history()
                .and_then(|h| h.messages.last().map(|m| m.content.clone())),
            DataType::OpenaiChat => self
                .as_openai_chat()
                .and_then(|r| r.messages.last().map(|m| m.content.clone().unwrap_or_default())),
            DataType::Json | DataType::SearchResults | DataType::Any => {
                Some(self.value.to_string())
            }
            DataType::Vector | DataType::OpenaiChatResponse => None,
        }
    }
}
