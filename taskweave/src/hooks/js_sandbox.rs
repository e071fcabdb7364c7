//! The `js_sandbox` hook: runs an inline script through the JS engine.
//!
//! Script errors are part of the structured result, never hook errors, so
//! chains can branch on them.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::functions::JsEngine;
use crate::provider::ToolDefinition;
use crate::value::{DataType, TypedValue};

use super::{HookCall, HookError, HookRepo};

pub const JS_SANDBOX_HOOK: &str = "js_sandbox";

pub struct JsSandboxHook {
    engine: JsEngine,
}

impl JsSandboxHook {
    pub fn new() -> Self {
        Self {
            engine: JsEngine::new(),
        }
    }

    fn extract_script(input: &TypedValue, call: &HookCall) -> Result<String, HookError> {
        if let Some(script) = input.value.get("code").and_then(|v| v.as_str()) {
            return Ok(script.to_string());
        }
        if let Some(script) = input.value.as_str() {
            return Ok(script.to_string());
        }
        if let Some(script) = call.args.get("script") {
            return Ok(script.clone());
        }
        Err(HookError::InvalidInput("js_sandbox needs a script".into()))
    }

    fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "code": { "type": "string", "description": "JavaScript to execute" }
            },
            "required": ["code"]
        })
    }
}

impl Default for JsSandboxHook {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HookRepo for JsSandboxHook {
    async fn supports(&self) -> Vec<String> {
        vec![JS_SANDBOX_HOOK.to_string()]
    }

    async fn exec(
        &self,
        cancel: &CancellationToken,
        _started_at: DateTime<Utc>,
        input: &TypedValue,
        _debug: bool,
        call: &HookCall,
    ) -> Result<TypedValue, HookError> {
        let script = Self::extract_script(input, call)?;
        let bindings = [("input", input.value.clone())];
        let outcome = self
            .engine
            .execute(cancel, &script, &bindings)
            .await
            .map_err(|e| HookError::Execution(e.to_string()))?;
        Ok(TypedValue::new(outcome.to_value(), DataType::Json))
    }

    async fn schemas(&self) -> HashMap<String, serde_json::Value> {
        HashMap::from([(JS_SANDBOX_HOOK.to_string(), Self::schema())])
    }

    async fn tools_for_hook(&self, name: &str) -> Result<Vec<ToolDefinition>, HookError> {
        if name != JS_SANDBOX_HOOK {
            return Err(HookError::UnknownHook(name.to_string()));
        }
        Ok(vec![ToolDefinition::function(
            JS_SANDBOX_HOOK,
            "Execute a JavaScript snippet in a sandbox",
            Self::schema(),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> HookCall {
        HookCall {
            name: JS_SANDBOX_HOOK.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn executes_code_field() {
        let hook = JsSandboxHook::new();
        let input = TypedValue::json(serde_json::json!({"code": "2 * 21"}));
        let out = hook
            .exec(&CancellationToken::new(), Utc::now(), &input, false, &call())
            .await
            .unwrap();
        assert_eq!(out.value["ok"], true);
        assert_eq!(out.value["result"], 42);
    }

    /// **Scenario**: a throwing script still returns a structured result with
    /// `ok: false`; the hook call itself succeeds.
    #[tokio::test]
    async fn script_errors_are_observable_results() {
        let hook = JsSandboxHook::new();
        let input = TypedValue::string("throw new Error('nope')");
        let out = hook
            .exec(&CancellationToken::new(), Utc::now(), &input, false, &call())
            .await
            .unwrap();
        assert_eq!(out.value["ok"], false);
        assert!(out.value["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn input_binding_is_visible() {
        let hook = JsSandboxHook::new();
        let input = TypedValue::json(serde_json::json!({"code": "input.code.length"}));
        let out = hook
            .exec(&CancellationToken::new(), Utc::now(), &input, false, &call())
            .await
            .unwrap();
        assert_eq!(out.value["result"], serde_json::json!("input.code.length".len()));
    }

    #[tokio::test]
    async fn missing_script_is_invalid_input() {
        let hook = JsSandboxHook::new();
        let err = hook
            .exec(
                &CancellationToken::new(),
                Utc::now(),
                &TypedValue::json(serde_json::json!({})),
                false,
                &call(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::InvalidInput(_)));
    }
}
