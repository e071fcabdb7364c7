//! Declared entities: the durable data model the runtime reconciles against.
//!
//! These shapes are what the [`crate::store`] contract persists. Runtime-only
//! projections (pulled models, backend runtime state) live in [`crate::state`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider convention a backend implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Ollama,
    Vllm,
    Openai,
    Gemini,
}

impl BackendType {
    /// Parses a stored type string, lowercased. Unknown strings yield `None`
    /// so the reconciler can record an explicit unsupported-type error
    /// instead of failing the tick.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ollama" => Some(Self::Ollama),
            "vllm" => Some(Self::Vllm),
            "openai" => Some(Self::Openai),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Vllm => "vllm",
            Self::Openai => "openai",
            Self::Gemini => "gemini",
        }
    }

    /// Cloud providers require an API key from the provider config.
    pub fn requires_api_key(&self) -> bool {
        matches!(self, Self::Openai | Self::Gemini)
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network endpoint serving models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub id: String,
    pub name: String,
    /// Unique across backends; doubles as the download-queue key for
    /// ollama-like backends.
    pub base_url: String,
    /// Stored as the raw string so unknown types survive round-trips; parse
    /// with [`BackendType::parse`].
    pub backend_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A declared model with its capability flags. Declared capabilities are the
/// source of truth used to enhance observed pulled-model entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    /// Must be positive.
    pub context_length: u32,
    pub can_chat: bool,
    pub can_embed: bool,
    pub can_prompt: bool,
    pub can_stream: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Purpose marker for the immutable internal embedding group.
pub const PURPOSE_EMBED: &str = "internal_embed_group";

/// A logical bundle declaring "these backends are expected to serve these
/// models". Assignments are separate many-to-many rows in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityGroup {
    pub id: String,
    pub name: String,
    pub purpose_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AffinityGroup {
    /// The embedding group may not be updated or deleted.
    pub fn immutable(&self) -> bool {
        self.purpose_type == PURPOSE_EMBED
    }
}

/// API-key material for a cloud provider type. Stored in KV under
/// `provider_config:<type>`; the key never appears in logs or Debug output.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_type: String,
    pub api_key: String,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider_type", &self.provider_type)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// KV key for a provider config.
pub fn provider_config_key(provider_type: &str) -> String {
    format!("provider_config:{provider_type}")
}

/// A queued model download. Identity for ollama-like backends is `base_url`,
/// which keeps at most one pending download per backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    /// Queue identity: the backend base URL.
    pub base_url: String,
    pub model_name: String,
    pub scheduled_for: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

/// A stored JavaScript function, compiled on demand into the function cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionEntry {
    /// Unique.
    pub name: String,
    /// Only `"javascript"` is executable today.
    pub script_type: String,
    pub script: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const SCRIPT_TYPE_JAVASCRIPT: &str = "javascript";

/// A remotely-invocable hook endpoint, consumed by the webhook hook repo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteHook {
    pub id: String,
    pub name: String,
    pub endpoint_url: String,
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Properties injected into the outgoing payload.
    #[serde(default)]
    pub injection: HashMap<String, serde_json::Value>,
}

/// A minimally-validated event captured straight off a webhook, before any
/// typing. Identified by `nid` within a `received_at` range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Monotonic sequence assigned by the store on append.
    #[serde(default)]
    pub nid: u64,
    pub received_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// An event appended to the log and published on `events.<event_type>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    /// Monotonic sequence assigned by the store on append.
    #[serde(default)]
    pub nid: u64,
    pub event_type: String,
    #[serde(default)]
    pub event_source: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: u32,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
