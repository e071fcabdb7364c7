//! The `webhook` hook repo: POSTs hook input to remote endpoints declared in
//! the store as [`crate::entities::RemoteHook`] rows.
//!
//! The reply is parsed leniently: JSON bodies become structured values,
//! anything else is kept as a string. Injection properties from the hook row
//! are merged into the outgoing payload.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::provider::ToolDefinition;
use crate::store::{Store, StoreError};
use crate::value::{DataType, TypedValue};

use super::{HookCall, HookError, HookRepo};

pub struct WebhookHook {
    store: Arc<dyn Store>,
    http: reqwest::Client,
}

impl WebhookHook {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
        }
    }

    fn open_schema() -> serde_json::Value {
        serde_json::json!({ "type": "object", "additionalProperties": true })
    }
}

#[async_trait]
impl HookRepo for WebhookHook {
    async fn supports(&self) -> Vec<String> {
        match self.store.list_remote_hooks().await {
            Ok(hooks) => hooks.into_iter().map(|h| h.name).collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn exec(
        &self,
        cancel: &CancellationToken,
        started_at: DateTime<Utc>,
        input: &TypedValue,
        _debug: bool,
        call: &HookCall,
    ) -> Result<TypedValue, HookError> {
        let hook = match self.store.get_remote_hook_by_name(&call.name).await {
            Ok(hook) => hook,
            Err(StoreError::NotFound) => return Err(HookError::UnknownHook(call.name.clone())),
            Err(e) => return Err(HookError::Execution(e.to_string())),
        };

        let mut payload = serde_json::json!({
            "hook": call.name,
            "tool_name": call.tool_name,
            "started_at": started_at.to_rfc3339(),
            "input": input.value,
            "input_type": input.data_type,
            "args": call.args,
        });
        for (key, value) in &hook.injection {
            payload[key] = value.clone();
        }

        let mut request = self
            .http
            .post(&hook.endpoint_url)
            .timeout(Duration::from_millis(hook.timeout_ms.max(1)))
            .json(&payload);
        for (name, value) in &hook.headers {
            request = request.header(name, value);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(HookError::Execution("cancelled".into())),
            resp = request.send() => resp.map_err(|e| HookError::Http(e.to_string()))?,
        };

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| HookError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(HookError::Http(format!("{}: {body}", status.as_u16())));
        }

        debug!(hook = %call.name, status = status.as_u16(), "webhook replied");
        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(value) => Ok(TypedValue::new(value, DataType::Json)),
            Err(_) => Ok(TypedValue::string(body)),
        }
    }

    async fn schemas(&self) -> HashMap<String, serde_json::Value> {
        self.supports()
            .await
            .into_iter()
            .map(|name| (name, Self::open_schema()))
            .collect()
    }

    async fn tools_for_hook(&self, name: &str) -> Result<Vec<ToolDefinition>, HookError> {
        let hook = match self.store.get_remote_hook_by_name(name).await {
            Ok(hook) => hook,
            Err(StoreError::NotFound) => return Err(HookError::UnknownHook(name.to_string())),
            Err(e) => return Err(HookError::Execution(e.to_string())),
        };
        Ok(vec![ToolDefinition::function(
            &hook.name,
            format!("Remote hook at {}", hook.endpoint_url),
            Self::open_schema(),
        )])
    }
}
