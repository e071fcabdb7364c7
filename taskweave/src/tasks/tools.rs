//! Chat completion with tool wiring, and tool-call execution through hooks.
//!
//! Tool failures inside `execute_tool_calls` are soft: the failure message
//! becomes the tool message content and execution continues, so the model can
//! react to a broken tool instead of the chain dying.

use chain_spec_core::TaskDefinition;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chain::ChainContext;
use crate::history::ChatMessage;
use crate::hooks::{HookCall, HookError, HookRepo, ResolvedTool};
use crate::provider::{Capability, ToolDefinition};
use crate::value::{DataType, TypedValue};

use super::{TaskError, TaskExecutor, TaskOutcome};

/// Tools offered to the model for one task: client tools (minus hidden ones)
/// when `pass_client_tools` is set, plus the tools of every listed hook.
pub(super) fn assemble_tools(ctx: &ChainContext, task: &TaskDefinition) -> Vec<ToolDefinition> {
    let mut tools = Vec::new();
    let Some(cfg) = &task.execute_config else {
        return tools;
    };

    if cfg.pass_client_tools {
        for tool in &ctx.client_tools {
            if cfg.hide_tools.iter().any(|h| h == &tool.function.name) {
                continue;
            }
            tools.push(tool.clone());
        }
    }

    for hook_name in &cfg.hooks {
        if let Some(hook_tools) = ctx.hook_tools.get(hook_name) {
            for tool in hook_tools {
                if tools.iter().any(|t: &ToolDefinition| t.function.name == tool.function.name) {
                    continue;
                }
                tools.push(tool.clone());
            }
        }
    }
    tools
}

/// Normalizes a hook's return into tool-message text: null stays literal,
/// strings pass through, everything else is JSON-marshalled.
fn hook_output_text(output: &TypedValue) -> String {
    match &output.value {
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl TaskExecutor {
    pub(super) async fn chat_completion(
        &self,
        cancel: &CancellationToken,
        ctx: &ChainContext,
        task: &TaskDefinition,
        input: &TypedValue,
    ) -> Result<TaskOutcome, TaskError> {
        let mut history = Self::history_input(task, input)?;
        let resolved = self.resolve_for(task, Capability::Chat)?;

        let prompt_tokens = self
            .token_counter()
            .count_history(&resolved.model_name, &history);
        if resolved.context_length > 0 && prompt_tokens > resolved.context_length {
            return Err(TaskError::ContextExceeded {
                needed: prompt_tokens,
                limit: resolved.context_length,
            });
        }

        let tools = assemble_tools(ctx, task);
        let result = resolved
            .client
            .chat(cancel, &history.messages, &tools, &Self::chat_args(task))
            .await?;

        let input_tokens = result.input_tokens.unwrap_or(prompt_tokens);
        let output_tokens = result.output_tokens.unwrap_or_else(|| {
            self.token_counter()
                .count(&resolved.model_name, &result.message.content)
        });

        let has_tool_calls = !result.message.tool_calls.is_empty();
        history.messages.push(result.message);
        history.model = Some(resolved.model_name.clone());
        history.input_tokens = input_tokens;
        history.output_tokens += output_tokens;

        self.charge(ctx, input_tokens + output_tokens)?;
        debug!(task = %task.id, model = %resolved.model_name, tool_calls = has_tool_calls, "chat turn completed");

        let output = TypedValue::chat_history(&history).map_err(|e| TaskError::Encode(e.to_string()))?;
        let transition = if has_tool_calls { "tool-call" } else { "executed" };
        Ok(TaskOutcome {
            output,
            transition: transition.to_string(),
        })
    }

    pub(super) async fn execute_tool_calls(
        &self,
        cancel: &CancellationToken,
        ctx: &ChainContext,
        task: &TaskDefinition,
        input: &TypedValue,
    ) -> Result<TaskOutcome, TaskError> {
        if input.data_type != DataType::ChatHistory {
            return Err(TaskError::InvalidInput {
                handler: "execute_tool_calls".into(),
                data_type: input.data_type,
            });
        }
        let mut history = Self::history_input(task, input)?;

        let Some(assistant) = history.last_assistant().cloned() else {
            return Ok(TaskOutcome {
                output: input.clone(),
                transition: "no_op".to_string(),
            });
        };
        if assistant.tool_calls.is_empty() {
            return Ok(TaskOutcome {
                output: input.clone(),
                transition: "no_calls_found".to_string(),
            });
        }

        let static_args = task
            .hook
            .as_ref()
            .map(|h| h.args.clone())
            .unwrap_or_default();

        let total = assistant.tool_calls.len();
        let mut failures = 0usize;
        for call in &assistant.tool_calls {
            let content = match self
                .run_one_tool_call(cancel, ctx, &call.function.name, &call.function.arguments, &static_args)
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    warn!(tool = %call.function.name, error = %e, "tool call failed; continuing");
                    failures += 1;
                    format!("tool {} failed: {e}", call.function.name)
                }
            };
            history.messages.push(ChatMessage::tool(content, &call.id));
        }

        let transition = if failures == total {
            "failed"
        } else {
            "tools_executed"
        };
        let output = TypedValue::chat_history(&history).map_err(|e| TaskError::Encode(e.to_string()))?;
        Ok(TaskOutcome {
            output,
            transition: transition.to_string(),
        })
    }

    /// Resolves one tool call to a hook and runs it. The static map from the
    /// chain context is consulted first, then the live repo scan.
    async fn run_one_tool_call(
        &self,
        cancel: &CancellationToken,
        ctx: &ChainContext,
        tool_name: &str,
        arguments: &str,
        static_args: &std::collections::HashMap<String, String>,
    ) -> Result<String, HookError> {
        let resolution: ResolvedTool = match ctx.tool_resolutions.get(tool_name) {
            Some(resolved) => resolved.clone(),
            None => self.hooks().resolve_tool(tool_name).await?,
        };

        let args_value: serde_json::Value = if arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(arguments)
                .map_err(|e| HookError::InvalidInput(format!("tool arguments: {e}")))?
        };

        let call = HookCall {
            name: resolution.hook_name.clone(),
            tool_name: Some(tool_name.to_string()),
            args: static_args.clone(),
        };
        let output = self
            .hooks()
            .exec(
                cancel,
                ctx.started_at,
                &TypedValue::new(args_value, DataType::Json),
                ctx.debug,
                &call,
            )
            .await?;
        Ok(hook_output_text(&output))
    }

    fn token_counter(&self) -> &dyn crate::provider::TokenCounter {
        self.tokens.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::history::{ChatHistory, FunctionCall, ToolCall};
    use chain_spec_core::TaskHandler;
    use std::sync::Arc;

    fn chat_input(messages: Vec<ChatMessage>) -> TypedValue {
        let mut history = ChatHistory::default();
        history.messages = messages;
        TypedValue::chat_history(&history).unwrap()
    }

    fn tool_call(id: &str, name: &str, args: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: name.into(),
                arguments: args.into(),
            },
        }
    }

    fn print_tools_ctx() -> crate::chain::ChainContext {
        let mut ctx = crate::chain::ChainContext::new(false, 0);
        let tool = crate::provider::ToolDefinition::function(
            "print",
            "print a message",
            serde_json::json!({"type": "object"}),
        );
        ctx.hook_tools.insert("print".into(), vec![tool.clone()]);
        ctx.tool_resolutions.insert(
            "print".into(),
            ResolvedTool {
                tool,
                hook_name: "print".into(),
            },
        );
        ctx
    }

    /// **Scenario**: chat with tool calls transitions to `tool-call`; without
    /// them, `executed`.
    #[tokio::test]
    async fn chat_transitions_on_tool_calls() {
        let client = Arc::new(FakeClient::replying(&["calling", "plain reply"]));
        client
            .tool_calls
            .lock()
            .unwrap()
            .push(vec![tool_call("c1", "print", r#"{"message":"ok"}"#)]);
        let executor = executor_with(client);
        let ctx = crate::chain::ChainContext::new(false, 0);
        let t = task(TaskHandler::ChatCompletion);

        let input = chat_input(vec![ChatMessage::user("hi")]);
        let out = executor
            .execute(&CancellationToken::new(), &ctx, &t, &input, None)
            .await
            .unwrap();
        assert_eq!(out.transition, "tool-call");

        let out = executor
            .execute(&CancellationToken::new(), &ctx, &t, &input, None)
            .await
            .unwrap();
        assert_eq!(out.transition, "executed");
        let history = out.output.as_chat_history().unwrap();
        assert_eq!(history.messages.last().unwrap().content, "plain reply");
        assert!(history.input_tokens > 0);
    }

    /// **Scenario**: tool wiring — hook tools from execute_config.hooks are
    /// offered; hidden client tools are not.
    #[tokio::test]
    async fn tool_assembly_respects_hide_and_hooks() {
        let mut ctx = print_tools_ctx();
        ctx.client_tools = vec![
            crate::provider::ToolDefinition::function("visible", "", serde_json::json!({})),
            crate::provider::ToolDefinition::function("secret", "", serde_json::json!({})),
        ];
        let mut t = task(TaskHandler::ChatCompletion);
        t.execute_config = Some(chain_spec_core::ExecuteConfig {
            pass_client_tools: true,
            hide_tools: vec!["secret".into()],
            hooks: vec!["print".into()],
            ..Default::default()
        });

        let tools = assemble_tools(&ctx, &t);
        let names: Vec<&str> = tools.iter().map(|t| t.function.name.as_str()).collect();
        assert_eq!(names, vec!["visible", "print"]);
    }

    /// **Scenario**: each appended tool message's tool_call_id equals the
    /// originating assistant call's id.
    #[tokio::test]
    async fn tool_messages_correlate_by_call_id() {
        let executor = executor_with(Arc::new(FakeClient::default()));
        let ctx = print_tools_ctx();
        let t = task(TaskHandler::ExecuteToolCalls);

        let mut assistant = ChatMessage::assistant("running tools");
        assistant.tool_calls = vec![
            tool_call("call_a", "print", r#"{"message":"first"}"#),
            tool_call("call_b", "print", r#"{"message":"second"}"#),
        ];
        let input = chat_input(vec![ChatMessage::user("go"), assistant]);

        let out = executor
            .execute(&CancellationToken::new(), &ctx, &t, &input, None)
            .await
            .unwrap();
        assert_eq!(out.transition, "tools_executed");

        let history = out.output.as_chat_history().unwrap();
        let tool_messages: Vec<&ChatMessage> =
            history.messages.iter().filter(|m| m.role == "tool").collect();
        assert_eq!(tool_messages.len(), 2);
        assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(tool_messages[0].content, "first");
        assert_eq!(tool_messages[1].tool_call_id.as_deref(), Some("call_b"));
        assert_eq!(tool_messages[1].content, "second");
    }

    /// **Scenario**: an unresolvable tool is a soft failure; its message
    /// carries the error and execution continues.
    #[tokio::test]
    async fn unknown_tool_fails_soft() {
        let executor = executor_with(Arc::new(FakeClient::default()));
        let ctx = print_tools_ctx();
        let t = task(TaskHandler::ExecuteToolCalls);

        let mut assistant = ChatMessage::assistant("mixed");
        assistant.tool_calls = vec![
            tool_call("c1", "ghost_tool", "{}"),
            tool_call("c2", "print", r#"{"message":"still ran"}"#),
        ];
        let input = chat_input(vec![assistant]);

        let out = executor
            .execute(&CancellationToken::new(), &ctx, &t, &input, None)
            .await
            .unwrap();
        assert_eq!(out.transition, "tools_executed");
        let history = out.output.as_chat_history().unwrap();
        assert!(history.messages[1].content.contains("ghost_tool"));
        assert_eq!(history.messages[2].content, "still ran");
    }

    #[tokio::test]
    async fn all_failures_transition_failed() {
        let executor = executor_with(Arc::new(FakeClient::default()));
        let ctx = crate::chain::ChainContext::new(false, 0);
        let t = task(TaskHandler::ExecuteToolCalls);

        let mut assistant = ChatMessage::assistant("bad");
        assistant.tool_calls = vec![tool_call("c1", "ghost", "{}")];
        let input = chat_input(vec![assistant]);
        let out = executor
            .execute(&CancellationToken::new(), &ctx, &t, &input, None)
            .await
            .unwrap();
        assert_eq!(out.transition, "failed");
    }

    #[tokio::test]
    async fn no_assistant_is_no_op_and_no_calls_found() {
        let executor = executor_with(Arc::new(FakeClient::default()));
        let ctx = crate::chain::ChainContext::new(false, 0);
        let t = task(TaskHandler::ExecuteToolCalls);

        let out = executor
            .execute(
                &CancellationToken::new(),
                &ctx,
                &t,
                &chat_input(vec![ChatMessage::user("only user")]),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.transition, "no_op");

        let out = executor
            .execute(
                &CancellationToken::new(),
                &ctx,
                &t,
                &chat_input(vec![ChatMessage::assistant("no calls")]),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.transition, "no_calls_found");
    }

    #[tokio::test]
    async fn openai_chat_input_is_converted() {
        let client = Arc::new(FakeClient::replying(&["reply"]));
        let executor = executor_with(client);
        let ctx = crate::chain::ChainContext::new(false, 0);
        let t = task(TaskHandler::ChatCompletion);

        let request = crate::history::OpenAiChatRequest {
            model: "m".into(),
            messages: vec![crate::history::OpenAiMessage {
                role: "user".into(),
                content: Some("hi".into()),
                tool_call_id: None,
                tool_calls: vec![],
            }],
            temperature: None,
        };
        let input = TypedValue::openai_chat(&request).unwrap();
        let out = executor
            .execute(&CancellationToken::new(), &ctx, &t, &input, None)
            .await
            .unwrap();
        assert_eq!(out.transition, "executed");
        assert_eq!(out.output.data_type, DataType::ChatHistory);
    }
}
