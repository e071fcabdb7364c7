//! Task execution: one enumerated handler per task, dispatched over the
//! typed value that flows through the chain.
//!
//! Handlers that call a model resolve their client through the provider
//! registry at execution time, honor the chain token budget, and surface a
//! transition signal the engine evaluates against the task's branches.

mod parsers;
mod tools;

pub use parsers::{
    normalize_js, parse_condition, parse_float, parse_int, parse_key_value, parse_range,
    parse_transition_command, strip_code_fences,
};

use std::sync::Arc;

use chain_spec_core::{TaskDefinition, TaskHandler};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chain::{ChainContext, TemplateError};
use crate::history::{history_from_openai, history_to_openai_response};
use crate::hooks::{HookCall, HookError, HookRepo, MultiHookRepo};
use crate::provider::{
    Capability, ChatArgs, ClientResolver, HeuristicTokenCounter, ProviderError, ResolveError,
    ResolveRequest, ResolvedClient, TokenCounter,
};
use crate::value::{DataType, TypedValue};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("handler {handler} cannot take {data_type} input")]
    InvalidInput { handler: String, data_type: DataType },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("parse failed: {0}")]
    Parse(String),
    #[error("{0}")]
    Raised(String),
    #[error("prompt needs {needed} tokens but the model context is {limit}")]
    ContextExceeded { needed: u32, limit: u32 },
    #[error("token budget exhausted: used {used} of {limit}")]
    BudgetExceeded { used: i64, limit: i64 },
    #[error("task cancelled")]
    Cancelled,
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Handler result: the produced value plus the transition signal.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub output: TypedValue,
    pub transition: String,
}

impl TaskOutcome {
    fn new(output: TypedValue, transition: impl Into<String>) -> Self {
        Self {
            output,
            transition: transition.into(),
        }
    }
}

pub struct TaskExecutor {
    resolver: Arc<dyn ClientResolver>,
    hooks: Arc<MultiHookRepo>,
    tokens: Arc<dyn TokenCounter>,
}

impl TaskExecutor {
    pub fn new(resolver: Arc<dyn ClientResolver>, hooks: Arc<MultiHookRepo>) -> Self {
        Self {
            resolver,
            hooks,
            tokens: Arc::new(HeuristicTokenCounter),
        }
    }

    pub fn with_token_counter(mut self, tokens: Arc<dyn TokenCounter>) -> Self {
        self.tokens = tokens;
        self
    }

    pub(crate) fn hooks(&self) -> &Arc<MultiHookRepo> {
        &self.hooks
    }

    /// Executes one task. `rendered_prompt` is the prompt-template output when
    /// the task declared one; otherwise handlers read the input directly.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        ctx: &ChainContext,
        task: &TaskDefinition,
        input: &TypedValue,
        rendered_prompt: Option<&str>,
    ) -> Result<TaskOutcome, TaskError> {
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        match task.handler {
            TaskHandler::Noop => Ok(TaskOutcome::new(input.clone(), "noop")),
            TaskHandler::PromptToString => {
                let response = self.run_prompt(cancel, ctx, task, input, rendered_prompt).await?;
                Ok(TaskOutcome::new(TypedValue::string(response.clone()), response))
            }
            TaskHandler::PromptToCondition => {
                let response = self.run_prompt(cancel, ctx, task, input, rendered_prompt).await?;
                let value = parse_condition(&response, &task.valid_conditions)
                    .map_err(TaskError::Parse)?;
                Ok(TaskOutcome::new(TypedValue::bool(value), value.to_string()))
            }
            TaskHandler::PromptToInt => {
                let response = self.run_prompt(cancel, ctx, task, input, rendered_prompt).await?;
                let value = parse_int(&response).map_err(TaskError::Parse)?;
                Ok(TaskOutcome::new(TypedValue::int(value), value.to_string()))
            }
            TaskHandler::PromptToFloat => {
                let response = self.run_prompt(cancel, ctx, task, input, rendered_prompt).await?;
                let value = parse_float(&response).map_err(TaskError::Parse)?;
                Ok(TaskOutcome::new(TypedValue::float(value), format!("{value:.2}")))
            }
            TaskHandler::PromptToRange => {
                let response = self.run_prompt(cancel, ctx, task, input, rendered_prompt).await?;
                let range = parse_range(&response).map_err(TaskError::Parse)?;
                Ok(TaskOutcome::new(TypedValue::string(range.clone()), range))
            }
            TaskHandler::ParseTransition => {
                let text = self.prompt_text(task, input, rendered_prompt)?;
                let command = parse_transition_command(&text);
                Ok(TaskOutcome::new(TypedValue::string(text), command))
            }
            TaskHandler::TextToEmbedding => {
                let text = self.prompt_text(task, input, rendered_prompt)?;
                let resolved = self.resolve_for(task, Capability::Embed)?;
                let vector = resolved.client.embed(cancel, &text).await?;
                self.charge(ctx, self.tokens.count(&resolved.model_name, &text))?;
                Ok(TaskOutcome::new(TypedValue::vector(vector), "ok"))
            }
            TaskHandler::RaiseError => {
                let message = self
                    .prompt_text(task, input, rendered_prompt)
                    .unwrap_or_else(|_| "raise_error".to_string());
                Err(TaskError::Raised(message))
            }
            TaskHandler::ParseKeyValue => {
                if input.data_type == DataType::Json {
                    return Ok(TaskOutcome::new(input.clone(), "already_json"));
                }
                let text = self.prompt_text(task, input, rendered_prompt)?;
                let parsed = parse_key_value(&text).map_err(TaskError::Parse)?;
                Ok(TaskOutcome::new(TypedValue::json(parsed), "parsed"))
            }
            TaskHandler::PromptToJs => {
                let response = self.run_prompt(cancel, ctx, task, input, rendered_prompt).await?;
                let code = normalize_js(&response);
                let transition = if code.is_empty() { "empty_js" } else { "ok" };
                Ok(TaskOutcome::new(
                    TypedValue::json(serde_json::json!({ "code": code })),
                    transition,
                ))
            }
            TaskHandler::ConvertToOpenaiChatResponse => {
                let Some(history) = input.as_chat_history() else {
                    return Err(TaskError::InvalidInput {
                        handler: "convert_to_openai_chat_response".into(),
                        data_type: input.data_type,
                    });
                };
                let response = history_to_openai_response(
                    &history,
                    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
                );
                let output = TypedValue::openai_chat_response(&response)
                    .map_err(|e| TaskError::Encode(e.to_string()))?;
                Ok(TaskOutcome::new(output, "converted"))
            }
            TaskHandler::ChatCompletion => self.chat_completion(cancel, ctx, task, input).await,
            TaskHandler::ExecuteToolCalls => self.execute_tool_calls(cancel, ctx, task, input).await,
            TaskHandler::Hook => self.run_hook(cancel, ctx, task, input).await,
        }
    }

    async fn run_hook(
        &self,
        cancel: &CancellationToken,
        ctx: &ChainContext,
        task: &TaskDefinition,
        input: &TypedValue,
    ) -> Result<TaskOutcome, TaskError> {
        let spec = task.hook.as_ref().ok_or_else(|| HookError::UnknownHook(String::new()))?;
        let call = HookCall::from(spec);
        let output = self
            .hooks
            .exec(cancel, ctx.started_at, input, ctx.debug, &call)
            .await?;

        let transition = if task.output_template.is_empty() {
            "ok".to_string()
        } else {
            let vars = std::collections::HashMap::from([("output".to_string(), output.clone())]);
            crate::chain::template::render(&task.output_template, &vars)?
        };
        Ok(TaskOutcome::new(output, transition))
    }

    /// The text a prompt-style handler consumes: the rendered template when
    /// present, otherwise the input's string form.
    fn prompt_text(
        &self,
        task: &TaskDefinition,
        input: &TypedValue,
        rendered_prompt: Option<&str>,
    ) -> Result<String, TaskError> {
        let text = match rendered_prompt {
            Some(rendered) => rendered.to_string(),
            None => input.render_string().ok_or(TaskError::InvalidInput {
                handler: format!("{:?}", task.handler),
                data_type: input.data_type,
            })?,
        };
        if text.trim().is_empty() {
            return Err(TaskError::EmptyPrompt);
        }
        Ok(text)
    }

    fn resolve_for(&self, task: &TaskDefinition, capability: Capability) -> Result<ResolvedClient, TaskError> {
        let (provider_types, model_names) = match &task.execute_config {
            Some(cfg) => (cfg.provider_types(), cfg.model_names()),
            None => (Vec::new(), Vec::new()),
        };
        Ok(self.resolver.resolve(&ResolveRequest {
            provider_types,
            model_names,
            capability,
            min_context_length: 0,
        })?)
    }

    fn chat_args(task: &TaskDefinition) -> ChatArgs {
        ChatArgs {
            temperature: task.execute_config.as_ref().and_then(|c| c.temperature),
            max_tokens: None,
        }
    }

    fn charge(&self, ctx: &ChainContext, count: u32) -> Result<(), TaskError> {
        ctx.charge_tokens(count)
            .map(|_| ())
            .map_err(|e| TaskError::BudgetExceeded {
                used: e.used,
                limit: e.limit,
            })
    }

    /// Shared path for the prompt_to_* handlers: resolve, precondition-check,
    /// call, account.
    async fn run_prompt(
        &self,
        cancel: &CancellationToken,
        ctx: &ChainContext,
        task: &TaskDefinition,
        input: &TypedValue,
        rendered_prompt: Option<&str>,
    ) -> Result<String, TaskError> {
        let prompt = self.prompt_text(task, input, rendered_prompt)?;
        let resolved = self.resolve_for(task, Capability::Prompt)?;

        let needed = self.tokens.count(&resolved.model_name, &task.system_instruction)
            + self.tokens.count(&resolved.model_name, &prompt);
        if resolved.context_length > 0 && needed > resolved.context_length {
            return Err(TaskError::ContextExceeded {
                needed,
                limit: resolved.context_length,
            });
        }

        let response = resolved
            .client
            .prompt(cancel, &task.system_instruction, &prompt, &Self::chat_args(task))
            .await?;
        debug!(task = %task.id, model = %resolved.model_name, "prompt completed");

        let spent = needed + self.tokens.count(&resolved.model_name, &response);
        self.charge(ctx, spent)?;
        Ok(response)
    }

    /// Accepts `chat_history` directly or `openai_chat` after conversion.
    pub(crate) fn history_input(
        task: &TaskDefinition,
        input: &TypedValue,
    ) -> Result<crate::history::ChatHistory, TaskError> {
        match input.data_type {
            DataType::ChatHistory => input.as_chat_history().ok_or(TaskError::InvalidInput {
                handler: format!("{:?}", task.handler),
                data_type: input.data_type,
            }),
            DataType::OpenaiChat => input
                .as_openai_chat()
                .map(|req| history_from_openai(&req))
                .ok_or(TaskError::InvalidInput {
                    handler: format!("{:?}", task.handler),
                    data_type: input.data_type,
                }),
            other => Err(TaskError::InvalidInput {
                handler: format!("{:?}", task.handler),
                data_type: other,
            }),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::history::{ChatHistory, ChatMessage};
    use std::sync::Arc;

    fn ctx() -> ChainContext {
        ChainContext::new(false, 0)
    }

    #[tokio::test]
    async fn noop_passes_input_through() {
        let executor = executor_with(Arc::new(FakeClient::default()));
        let out = executor
            .execute(
                &CancellationToken::new(),
                &ctx(),
                &task(TaskHandler::Noop),
                &TypedValue::string("x"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.transition, "noop");
        assert_eq!(out.output.value, serde_json::json!("x"));
    }

    #[tokio::test]
    async fn prompt_to_string_transitions_on_the_reply() {
        let executor = executor_with(Arc::new(FakeClient::replying(&["Echo: hi"])));
        let out = executor
            .execute(
                &CancellationToken::new(),
                &ctx(),
                &task(TaskHandler::PromptToString),
                &TypedValue::string("hi"),
                Some("Echo: hi"),
            )
            .await
            .unwrap();
        assert_eq!(out.transition, "Echo: hi");
        assert_eq!(out.output.data_type, DataType::String);
    }

    #[tokio::test]
    async fn empty_prompt_rejected() {
        let executor = executor_with(Arc::new(FakeClient::default()));
        let err = executor
            .execute(
                &CancellationToken::new(),
                &ctx(),
                &task(TaskHandler::PromptToString),
                &TypedValue::string("   "),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::EmptyPrompt));
    }

    /// **Scenario**: condition replies map through valid_conditions; the
    /// transition is the bool's string form.
    #[tokio::test]
    async fn prompt_to_condition_maps_reply() {
        let executor = executor_with(Arc::new(FakeClient::replying(&["Yes"])));
        let mut t = task(TaskHandler::PromptToCondition);
        t.valid_conditions =
            std::collections::HashMap::from([("yes".to_string(), true), ("no".to_string(), false)]);
        let out = executor
            .execute(&CancellationToken::new(), &ctx(), &t, &TypedValue::string("q"), None)
            .await
            .unwrap();
        assert_eq!(out.transition, "true");
        assert_eq!(out.output.value, serde_json::json!(true));
    }

    #[tokio::test]
    async fn prompt_to_int_and_float_and_range() {
        let executor = executor_with(Arc::new(FakeClient::replying(&["42", "2.5", "3-7"])));
        let out = executor
            .execute(
                &CancellationToken::new(),
                &ctx(),
                &task(TaskHandler::PromptToInt),
                &TypedValue::string("q"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.transition, "42");

        let out = executor
            .execute(
                &CancellationToken::new(),
                &ctx(),
                &task(TaskHandler::PromptToFloat),
                &TypedValue::string("q"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.transition, "2.50");

        let out = executor
            .execute(
                &CancellationToken::new(),
                &ctx(),
                &task(TaskHandler::PromptToRange),
                &TypedValue::string("q"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.transition, "3-7");
    }

    #[tokio::test]
    async fn parse_transition_extracts_command() {
        let executor = executor_with(Arc::new(FakeClient::default()));
        let out = executor
            .execute(
                &CancellationToken::new(),
                &ctx(),
                &task(TaskHandler::ParseTransition),
                &TypedValue::string("/approve it"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.transition, "approve");
        // Output passes through unchanged.
        assert_eq!(out.output.value, serde_json::json!("/approve it"));
    }

    #[tokio::test]
    async fn text_to_embedding_yields_vector() {
        let executor = executor_with(Arc::new(FakeClient::default()));
        let out = executor
            .execute(
                &CancellationToken::new(),
                &ctx(),
                &task(TaskHandler::TextToEmbedding),
                &TypedValue::string("embed me"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.transition, "ok");
        assert_eq!(out.output.data_type, DataType::Vector);
    }

    #[tokio::test]
    async fn raise_error_fails_with_message() {
        let executor = executor_with(Arc::new(FakeClient::default()));
        let err = executor
            .execute(
                &CancellationToken::new(),
                &ctx(),
                &task(TaskHandler::RaiseError),
                &TypedValue::string("boom"),
                None,
            )
            .await
            .unwrap_err();
        match err {
            TaskError::Raised(msg) => assert_eq!(msg, "boom"),
            other => panic!("expected Raised, got {other:?}"),
        }
    }

    /// **Scenario**: parse_key_value is idempotent on already-JSON input.
    #[tokio::test]
    async fn parse_key_value_idempotent_on_json() {
        let executor = executor_with(Arc::new(FakeClient::default()));
        let json_in = TypedValue::json(serde_json::json!({"a": 1}));
        let out = executor
            .execute(
                &CancellationToken::new(),
                &ctx(),
                &task(TaskHandler::ParseKeyValue),
                &json_in,
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.transition, "already_json");
        assert_eq!(out.output.value, json_in.value);

        let out = executor
            .execute(
                &CancellationToken::new(),
                &ctx(),
                &task(TaskHandler::ParseKeyValue),
                &TypedValue::string(r#"a=1, b=true, c="x""#),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.transition, "parsed");
        assert_eq!(out.output.value, serde_json::json!({"a": 1, "b": true, "c": "x"}));
    }

    #[tokio::test]
    async fn prompt_to_js_normalizes_fences() {
        let executor = executor_with(Arc::new(FakeClient::replying(&["```js\nreturn 1;\n```"])));
        let out = executor
            .execute(
                &CancellationToken::new(),
                &ctx(),
                &task(TaskHandler::PromptToJs),
                &TypedValue::string("write js"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.transition, "ok");
        assert_eq!(out.output.value["code"], "return 1;");
    }

    #[tokio::test]
    async fn prompt_to_js_flags_empty_code() {
        let executor = executor_with(Arc::new(FakeClient::replying(&[""])));
        let mut t = task(TaskHandler::PromptToJs);
        t.prompt_template = String::new();
        let err_or = executor
            .execute(
                &CancellationToken::new(),
                &ctx(),
                &t,
                &TypedValue::string("q"),
                Some("q"),
            )
            .await
            .unwrap();
        assert_eq!(err_or.transition, "empty_js");
    }

    #[tokio::test]
    async fn convert_requires_chat_history() {
        let executor = executor_with(Arc::new(FakeClient::default()));
        let err = executor
            .execute(
                &CancellationToken::new(),
                &ctx(),
                &task(TaskHandler::ConvertToOpenaiChatResponse),
                &TypedValue::string("not a history"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidInput { .. }));

        let mut history = ChatHistory::default();
        history.messages.push(ChatMessage::assistant("final"));
        let out = executor
            .execute(
                &CancellationToken::new(),
                &ctx(),
                &task(TaskHandler::ConvertToOpenaiChatResponse),
                &TypedValue::chat_history(&history).unwrap(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.transition, "converted");
        assert_eq!(out.output.data_type, DataType::OpenaiChatResponse);
    }

    /// **Scenario**: the chain budget trips once accumulated usage passes the
    /// limit.
    #[tokio::test]
    async fn budget_exhaustion_is_terminal() {
        let executor = executor_with(Arc::new(FakeClient::replying(&["a response", "another"])));
        let ctx = ChainContext::new(false, 8);
        let t = task(TaskHandler::PromptToString);
        // First call fits, second trips the accumulated budget.
        let first = executor
            .execute(&CancellationToken::new(), &ctx, &t, &TypedValue::string("hi"), None)
            .await;
        assert!(first.is_ok());
        let err = executor
            .execute(&CancellationToken::new(), &ctx, &t, &TypedValue::string("hi again longer"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn context_length_precondition() {
        let client = Arc::new(FakeClient {
            context_length: 2,
            ..Default::default()
        });
        let executor = executor_with(client);
        let err = executor
            .execute(
                &CancellationToken::new(),
                &ctx(),
                &task(TaskHandler::PromptToString),
                &TypedValue::string("a prompt much longer than two tokens"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::ContextExceeded { .. }));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let executor = executor_with(Arc::new(FakeClient::default()));
        let token = CancellationToken::new();
        token.cancel();
        let err = executor
            .execute(
                &token,
                &ctx(),
                &task(TaskHandler::Noop),
                &TypedValue::string("x"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
    }
}
