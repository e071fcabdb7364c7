//! The `print` hook: echoes its message argument. The simplest repo, used by
//! chains for observable side effects and by the test suite as a real tool.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::provider::ToolDefinition;
use crate::value::TypedValue;

use super::{HookCall, HookError, HookRepo};

pub const PRINT_HOOK: &str = "print";

pub struct PrintHook;

fn message_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "message": { "type": "string", "description": "Text to print" }
        },
        "required": ["message"]
    })
}

#[async_trait]
impl HookRepo for PrintHook {
    async fn supports(&self) -> Vec<String> {
        vec![PRINT_HOOK.to_string()]
    }

    async fn exec(
        &self,
        _cancel: &CancellationToken,
        _started_at: DateTime<Utc>,
        input: &TypedValue,
        debug: bool,
        call: &HookCall,
    ) -> Result<TypedValue, HookError> {
        // Dynamic tool args land in the input object; static args in the call.
        let message = input
            .value
            .get("message")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| call.args.get("message").cloned())
            .or_else(|| input.render_string())
            .ok_or_else(|| HookError::InvalidInput("print needs a message".into()))?;

        if debug {
            info!(%message, "print hook");
        } else {
            println!("{message}");
        }
        Ok(TypedValue::string(message))
    }

    async fn schemas(&self) -> HashMap<String, serde_json::Value> {
        HashMap::from([(PRINT_HOOK.to_string(), message_schema())])
    }

    async fn tools_for_hook(&self, name: &str) -> Result<Vec<ToolDefinition>, HookError> {
        if name != PRINT_HOOK {
            return Err(HookError::UnknownHook(name.to_string()));
        }
        Ok(vec![ToolDefinition::function(
            PRINT_HOOK,
            "Print a message for the user",
            message_schema(),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_from_input_object_wins() {
        let hook = PrintHook;
        let input = TypedValue::json(serde_json::json!({"message": "ok"}));
        let out = hook
            .exec(
                &CancellationToken::new(),
                Utc::now(),
                &input,
                true,
                &HookCall { name: PRINT_HOOK.into(), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(out.value, serde_json::json!("ok"));
    }

    #[tokio::test]
    async fn static_args_fall_back() {
        let hook = PrintHook;
        let call = HookCall {
            name: PRINT_HOOK.into(),
            tool_name: None,
            args: HashMap::from([("message".to_string(), "static".to_string())]),
        };
        let out = hook
            .exec(
                &CancellationToken::new(),
                Utc::now(),
                &TypedValue::json(serde_json::json!({})),
                true,
                &call,
            )
            .await
            .unwrap();
        assert_eq!(out.value, serde_json::json!("static"));
    }

    #[tokio::test]
    async fn exposes_one_tool() {
        let hook = PrintHook;
        let tools = hook.tools_for_hook(PRINT_HOOK).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function.name, "print");
    }
}
