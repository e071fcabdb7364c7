//! Task handler enumeration: the exhaustive set of behaviors a task may run.

use serde::{Deserialize, Serialize};

/// Enumerated task behavior. Each variant maps to one executor routine; the
/// set is closed so a chain referencing an unknown handler fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskHandler {
    /// Pass the input through untouched.
    Noop,
    /// Send the rendered prompt to an LLM, keep the raw string reply.
    PromptToString,
    /// Send the prompt, map the reply through `valid_conditions` to a bool.
    PromptToCondition,
    /// Send the prompt, parse the reply as an integer.
    PromptToInt,
    /// Send the prompt, parse the reply as a float.
    PromptToFloat,
    /// Send the prompt, parse the reply as an `"a-b"` numeric range.
    PromptToRange,
    /// Parse a leading-slash command out of the input (no LLM call).
    ParseTransition,
    /// Embed the input text into a vector.
    TextToEmbedding,
    /// Fail the chain with the input as the error message.
    RaiseError,
    /// Parse `k=v, ...` pairs into a JSON object; pass JSON through.
    ParseKeyValue,
    /// Send the prompt, normalize the reply into a `{code}` JSON object.
    PromptToJs,
    /// Convert an internal chat history into an OpenAI-shaped response.
    ConvertToOpenaiChatResponse,
    /// Run one chat turn, optionally offering tools to the model.
    ChatCompletion,
    /// Execute the tool calls from the last assistant message via hooks.
    ExecuteToolCalls,
    /// Invoke a named hook with the task input.
    Hook,
}

impl TaskHandler {
    /// The closed set of transition signals this handler can produce, when
    /// that set is known statically. Handlers whose signal is derived from
    /// model output (e.g. [`TaskHandler::PromptToString`]) return `None`.
    ///
    /// Validation uses this: a task needs a `default` branch unless every
    /// signal listed here has an explicit branch.
    pub fn known_signals(&self) -> Option<&'static [&'static str]> {
        match self {
            TaskHandler::Noop => Some(&["noop"]),
            TaskHandler::PromptToCondition => Some(&["true", "false"]),
            TaskHandler::TextToEmbedding => Some(&["ok"]),
            TaskHandler::ParseKeyValue => Some(&["parsed", "already_json"]),
            TaskHandler::PromptToJs => Some(&["ok", "empty_js"]),
            TaskHandler::ConvertToOpenaiChatResponse => Some(&["converted"]),
            TaskHandler::ChatCompletion => Some(&["tool-call", "executed"]),
            TaskHandler::ExecuteToolCalls => {
                Some(&["tools_executed", "no_calls_found", "no_op", "failed"])
            }
            // RaiseError never transitions; it is accepted with any branches.
            TaskHandler::RaiseError => Some(&[]),
            TaskHandler::PromptToString
            | TaskHandler::PromptToInt
            | TaskHandler::PromptToFloat
            | TaskHandler::PromptToRange
            | TaskHandler::ParseTransition
            | TaskHandler::Hook => None,
        }
    }

    /// True when the handler issues an LLM call and therefore needs an
    /// execute config (or inherits the chain default) at runtime.
    pub fn calls_model(&self) -> bool {
        matches!(
            self,
            TaskHandler::PromptToString
                | TaskHandler::PromptToCondition
                | TaskHandler::PromptToInt
                | TaskHandler::PromptToFloat
                | TaskHandler::PromptToRange
                | TaskHandler::TextToEmbedding
                | TaskHandler::PromptToJs
                | TaskHandler::ChatCompletion
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: handlers serialize to the snake_case names used in chain JSON.
    #[test]
    fn handler_serde_names_are_snake_case() {
        let json = serde_json::to_string(&TaskHandler::PromptToCondition).unwrap();
        assert_eq!(json, "\"prompt_to_condition\"");
        let back: TaskHandler = serde_json::from_str("\"execute_tool_calls\"").unwrap();
        assert_eq!(back, TaskHandler::ExecuteToolCalls);
    }

    /// **Scenario**: an unknown handler name fails to parse instead of defaulting.
    #[test]
    fn unknown_handler_rejected() {
        let err = serde_json::from_str::<TaskHandler>("\"prompt_to_banana\"");
        assert!(err.is_err());
    }

    #[test]
    fn chat_completion_signals_are_closed() {
        let signals = TaskHandler::ChatCompletion.known_signals().unwrap();
        assert!(signals.contains(&"tool-call"));
        assert!(signals.contains(&"executed"));
    }

    #[test]
    fn model_calling_handlers_flagged() {
        assert!(TaskHandler::ChatCompletion.calls_model());
        assert!(TaskHandler::PromptToRange.calls_model());
        assert!(!TaskHandler::ParseTransition.calls_model());
        assert!(!TaskHandler::Hook.calls_model());
    }
}
