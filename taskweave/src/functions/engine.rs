//! JavaScript execution: a fresh engine context per call.
//!
//! Contexts are single-threaded and never shared; each execution gets its own
//! with per-call builtins (a `console.log` capture buffer and the triggering
//! `event` as a global). Script errors come back inside [`JsOutcome`], not as
//! Rust errors, so callers can observe them.

use boa_engine::{Context, Source};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::FunctionError;

/// Prelude installed before the user script: log capture plus the event
/// global. The event arrives as a JSON string literal to avoid any code
/// injection through event data.
const PRELUDE: &str = r#"
var __logs = [];
var console = {
    log: function () { __logs.push(Array.prototype.slice.call(arguments).join(" ")); },
    error: function () { __logs.push(Array.prototype.slice.call(arguments).join(" ")); }
};
"#;

/// Result of one script execution.
#[derive(Debug, Clone, Serialize)]
pub struct JsOutcome {
    pub ok: bool,
    /// Completion value of the script, JSON-converted; `null` for undefined.
    pub result: serde_json::Value,
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JsOutcome {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Stateless engine handle. Each call builds a throwaway context on a
/// blocking thread (boa contexts are not `Send`).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsEngine;

impl JsEngine {
    pub fn new() -> Self {
        Self
    }

    /// Parses the script without running it. Used by the cache to validate
    /// entries at sync time.
    pub async fn check(&self, source: &str) -> Result<(), FunctionError> {
        let source = source.to_string();
        tokio::task::spawn_blocking(move || {
            let mut context = Context::default();
            boa_engine::Script::parse(Source::from_bytes(source.as_bytes()), None, &mut context)
                .map(|_| ())
                .map_err(|e| FunctionError::Compile(e.to_string()))
        })
        .await
        .map_err(|e| FunctionError::Engine(e.to_string()))?
    }

    /// Runs the script with `bindings` exposed as JSON globals. Compile and
    /// runtime errors are captured in the outcome.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        source: &str,
        bindings: &[(&str, serde_json::Value)],
    ) -> Result<JsOutcome, FunctionError> {
        let source = source.to_string();
        let mut prelude = String::from(PRELUDE);
        for (name, value) in bindings {
            let literal = serde_json::to_string(&value.to_string())
                .map_err(|e| FunctionError::Engine(e.to_string()))?;
            prelude.push_str(&format!("var {name} = JSON.parse({literal});\n"));
        }

        let task = tokio::task::spawn_blocking(move || run_in_context(&prelude, &source));
        tokio::select! {
            _ = cancel.cancelled() => Err(FunctionError::Cancelled),
            outcome = task => outcome.map_err(|e| FunctionError::Engine(e.to_string())),
        }
    }
}

fn run_in_context(prelude: &str, source: &str) -> JsOutcome {
    let mut context = Context::default();

    if let Err(e) = context.eval(Source::from_bytes(prelude.as_bytes())) {
        return JsOutcome {
            ok: false,
            result: serde_json::Value::Null,
            logs: Vec::new(),
            error: Some(format!("prelude: {e}")),
        };
    }

    let completion = context.eval(Source::from_bytes(source.as_bytes()));
    let logs = read_logs(&mut context);

    match completion {
        Ok(value) => {
            let result = if value.is_undefined() || value.is_null() {
                serde_json::Value::Null
            } else {
                value.to_json(&mut context).unwrap_or(serde_json::Value::Null)
            };
            JsOutcome {
                ok: true,
                result,
                logs,
                error: None,
            }
        }
        Err(e) => JsOutcome {
            ok: false,
            result: serde_json::Value::Null,
            logs,
            error: Some(e.to_string()),
        },
    }
}

fn read_logs(context: &mut Context) -> Vec<String> {
    let Ok(value) = context.eval(Source::from_bytes(b"__logs")) else {
        return Vec::new();
    };
    let Ok(json) = value.to_json(context) else {
        return Vec::new();
    };
    match json {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}
