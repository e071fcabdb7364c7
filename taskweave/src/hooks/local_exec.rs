//! The `local_exec` hook: runs an allowlisted command on the host.
//!
//! Disabled by default. The denylist is enforced unconditionally; when
//! enabled, only commands on the allowlist run. Output is returned as a
//! structured JSON result with exit code, stdout, and stderr.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::provider::ToolDefinition;
use crate::value::{DataType, TypedValue};

use super::{HookCall, HookError, HookRepo};

pub const LOCAL_EXEC_HOOK: &str = "local_exec";

pub struct LocalExecHook {
    enabled: bool,
    allowlist: Vec<String>,
    denylist: Vec<String>,
}

impl LocalExecHook {
    pub fn new(enabled: bool, allowlist: Vec<String>, denylist: Vec<String>) -> Self {
        Self {
            enabled,
            allowlist,
            denylist,
        }
    }

    pub fn from_config(cfg: &::config::RuntimeConfig) -> Self {
        Self::new(
            cfg.local_exec_enabled,
            cfg.local_exec_allowlist.clone(),
            cfg.local_exec_denylist.clone(),
        )
    }

    fn check_command(&self, command: &str) -> Result<(), HookError> {
        if !self.enabled {
            return Err(HookError::Disabled(LOCAL_EXEC_HOOK.into()));
        }
        if self.denylist.iter().any(|d| d == command) {
            return Err(HookError::Denied(command.to_string()));
        }
        if !self.allowlist.iter().any(|a| a == command) {
            return Err(HookError::Denied(format!("{command} not allowlisted")));
        }
        Ok(())
    }

    fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" },
                "args": { "type": "string", "description": "Space-separated arguments" }
            },
            "required": ["command"]
        })
    }
}

#[async_trait]
impl HookRepo for LocalExecHook {
    async fn supports(&self) -> Vec<String> {
        vec![LOCAL_EXEC_HOOK.to_string()]
    }

    async fn exec(
        &self,
        cancel: &CancellationToken,
        _started_at: DateTime<Utc>,
        input: &TypedValue,
        _debug: bool,
        call: &HookCall,
    ) -> Result<TypedValue, HookError> {
        let command = input
            .value
            .get("command")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| call.args.get("command").cloned())
            .ok_or_else(|| HookError::InvalidInput("local_exec needs a command".into()))?;
        self.check_command(&command)?;

        let args: Vec<String> = input
            .value
            .get("args")
            .and_then(|v| v.as_str())
            .or_else(|| call.args.get("args").map(String::as_str))
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        info!(%command, "local_exec running command");
        let child = Command::new(&command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| HookError::Execution(format!("spawn {command}: {e}")))?;

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(HookError::Execution("cancelled".into())),
            output = child.wait_with_output() => {
                output.map_err(|e| HookError::Execution(e.to_string()))?
            }
        };

        Ok(TypedValue::new(
            serde_json::json!({
                "command": command,
                "exit_code": output.status.code(),
                "stdout": String::from_utf8_lossy(&output.stdout),
                "stderr": String::from_utf8_lossy(&output.stderr),
            }),
            DataType::Json,
        ))
    }

    async fn schemas(&self) -> HashMap<String, serde_json::Value> {
        HashMap::from([(LOCAL_EXEC_HOOK.to_string(), Self::schema())])
    }

    async fn tools_for_hook(&self, name: &str) -> Result<Vec<ToolDefinition>, HookError> {
        if name != LOCAL_EXEC_HOOK {
            return Err(HookError::UnknownHook(name.to_string()));
        }
        Ok(vec![ToolDefinition::function(
            LOCAL_EXEC_HOOK,
            "Run an allowlisted local command",
            Self::schema(),
        )])
    }
}
