//! Hook dispatch: named side-effectful capabilities behind a uniform `exec`
//! contract, also selectable as LLM-visible tools.
//!
//! A [`HookRepo`] announces the hook names it serves; [`MultiHookRepo`]
//! composes repos by scanning `supports()` until the first match. Tools and
//! schemas merge by union, first repo winning on collisions.
//! [`MultiHookRepo::resolve_tool`] maps an LLM tool call back to the hook
//! that executes it.

mod js_sandbox;
mod local_exec;
mod print;
mod webhook;

pub use js_sandbox::JsSandboxHook;
pub use local_exec::LocalExecHook;
pub use print::PrintHook;
pub use webhook::WebhookHook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::provider::ToolDefinition;
use crate::value::TypedValue;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("unknown hook: {0}")]
    UnknownHook(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("hook disabled: {0}")]
    Disabled(String),
    #[error("command denied: {0}")]
    Denied(String),
    #[error("invalid hook input: {0}")]
    InvalidInput(String),
    #[error("hook request failed: {0}")]
    Http(String),
    #[error("hook execution failed: {0}")]
    Execution(String),
}

/// A hook invocation: the capability name, optional tool alias, and static
/// string arguments from the task definition.
#[derive(Debug, Clone, Default)]
pub struct HookCall {
    pub name: String,
    pub tool_name: Option<String>,
    pub args: HashMap<String, String>,
}

impl From<&chain_spec_core::HookSpec> for HookCall {
    fn from(spec: &chain_spec_core::HookSpec) -> Self {
        Self {
            name: spec.name.clone(),
            tool_name: spec.tool_name.clone(),
            args: spec.args.clone(),
        }
    }
}

/// A tool the LLM may call, together with the hook it resolves to.
#[derive(Debug, Clone)]
pub struct ResolvedTool {
    pub tool: ToolDefinition,
    /// Hook under which the tool must be executed.
    pub hook_name: String,
}

/// Uniform hook contract.
#[async_trait]
pub trait HookRepo: Send + Sync {
    /// Hook names this repo serves.
    async fn supports(&self) -> Vec<String>;

    /// Executes one hook call against the given input. The returned value
    /// carries its own data type.
    async fn exec(
        &self,
        cancel: &CancellationToken,
        started_at: DateTime<Utc>,
        input: &TypedValue,
        debug: bool,
        call: &HookCall,
    ) -> Result<TypedValue, HookError>;

    /// JSON schemas per supported hook.
    async fn schemas(&self) -> HashMap<String, serde_json::Value>;

    /// Tools exposed for one hook; used to wire hooks into LLM calls.
    async fn tools_for_hook(&self, name: &str) -> Result<Vec<ToolDefinition>, HookError>;
}

/// Composition of hook repos: first repo claiming a name wins.
pub struct MultiHookRepo {
    repos: Vec<Arc<dyn HookRepo>>,
}

impl MultiHookRepo {
    pub fn new(repos: Vec<Arc<dyn HookRepo>>) -> Self {
        Self { repos }
    }

    async fn repo_for(&self, name: &str) -> Option<&Arc<dyn HookRepo>> {
        for repo in &self.repos {
            if repo.supports().await.iter().any(|n| n == name) {
                return Some(repo);
            }
        }
        None
    }

    /// Maps a tool name (as produced by the LLM) to the hook executing it:
    /// first an exact hook-name match, then a scan over every hook's tool
    /// list for a matching `function.name`.
    pub async fn resolve_tool(&self, tool_name: &str) -> Result<ResolvedTool, HookError> {
        for repo in &self.repos {
            for hook_name in repo.supports().await {
                let tools = repo.tools_for_hook(&hook_name).await.unwrap_or_default();
                if hook_name == tool_name {
                    if let Some(tool) = tools.first() {
                        return Ok(ResolvedTool {
                            tool: tool.clone(),
                            hook_name,
                        });
                    }
                }
                if let Some(tool) = tools.iter().find(|t| t.function.name == tool_name) {
                    return Ok(ResolvedTool {
                        tool: tool.clone(),
                        hook_name,
                    });
                }
            }
        }
        Err(HookError::UnknownTool(tool_name.to_string()))
    }
}

#[async_trait]
impl HookRepo for MultiHookRepo {
    async fn supports(&self) -> Vec<String> {
        let mut names = Vec::new();
        for repo in &self.repos {
            for name in repo.supports().await {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    async fn exec(
        &self,
        cancel: &CancellationToken,
        started_at: DateTime<Utc>,
        input: &TypedValue,
        debug: bool,
        call: &HookCall,
    ) -> Result<TypedValue, HookError> {
        match self.repo_for(&call.name).await {
            Some(repo) => repo.exec(cancel, started_at, input, debug, call).await,
            None => Err(HookError::UnknownHook(call.name.clone())),
        }
    }

    async fn schemas(&self) -> HashMap<String, serde_json::Value> {
        let mut merged = HashMap::new();
        for repo in &self.repos {
            for (name, schema) in repo.schemas().await {
                merged.entry(name).or_insert(schema);
            }
        }
        merged
    }

    async fn tools_for_hook(&self, name: &str) -> Result<Vec<ToolDefinition>, HookError> {
        match self.repo_for(name).await {
            Some(repo) => repo.tools_for_hook(name).await,
            None => Err(HookError::UnknownHook(name.to_string())),
        }
    }
}
