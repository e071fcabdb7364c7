//! The chain engine: validate once, then interpret the transition state
//! machine task by task.
//!
//! Mutable execution state is a variable map `name → TypedValue` plus the
//! current task id; everything else (tools, budget, debug flag) lives in the
//! immutable [`ChainContext`]. Templates render against the variable map
//! before each handler runs, so later tasks can address earlier outputs,
//! including nested JSON fields.

mod context;
mod eval;
mod registry;
pub(crate) mod template;

pub use context::{BudgetExceeded, ChainContext, StepTrace};
pub use eval::select_branch;
pub use registry::{delete_chain, list_chains, load_chain, store_chain};
pub use template::TemplateError;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chain_spec_core::{
    validate_chain, ChainDefinition, TaskDefinition, ValidationError, TERM_END, TERM_ERROR,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hooks::{HookError, HookRepo, MultiHookRepo, ResolvedTool};
use crate::provider::ToolDefinition;
use crate::tasks::{TaskError, TaskExecutor, TaskOutcome};
use crate::value::TypedValue;

/// Variable name the initial chain input is stored under.
pub const VAR_INPUT: &str = "input";

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid chain: {0}")]
    Validation(#[from] ValidationError),
    #[error("hook {hook} cannot be resolved: {source}")]
    HookResolution { hook: String, source: HookError },
    #[error("task {task_id} reads unknown variable {var}")]
    MissingVariable { task_id: String, var: String },
    #[error("task {task_id}: no transition matched signal {signal:?}")]
    NoTransitionMatched { task_id: String, signal: String },
    #[error("task {task_id} failed: {source}")]
    TaskFailed { task_id: String, source: TaskError },
    #[error("chain terminated with error at task {task_id}: {message}")]
    Terminated { task_id: String, message: String },
    #[error("chain cancelled")]
    Cancelled,
    #[error("internal failure: {0}")]
    Internal(String),
}

/// Final output plus the step trace (empty unless the chain sets `debug`).
#[derive(Debug)]
pub struct ChainResult {
    pub output: TypedValue,
    pub steps: Vec<StepTrace>,
}

pub struct ChainEngine {
    executor: TaskExecutor,
    hooks: Arc<MultiHookRepo>,
}

impl ChainEngine {
    pub fn new(executor: TaskExecutor, hooks: Arc<MultiHookRepo>) -> Self {
        Self { executor, hooks }
    }

    /// Executes a chain to a terminal sentinel.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        chain: &ChainDefinition,
        input: TypedValue,
        client_tools: Vec<ToolDefinition>,
    ) -> Result<ChainResult, ChainError> {
        validate_chain(chain)?;
        let ctx = self.build_context(chain, client_tools).await?;

        let mut vars: HashMap<String, TypedValue> = HashMap::new();
        vars.insert(VAR_INPUT.to_string(), input.clone());

        let mut previous = input;
        let mut current_id = chain.tasks[0].id.clone();
        let mut steps = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return Err(ChainError::Cancelled);
            }
            let task = chain
                .task(&current_id)
                .expect("validated chain has all branch targets");

            let task_input = self.task_input(task, &vars, &previous)?;
            let started = Instant::now();

            let attempt_result = self
                .run_with_retry(cancel, &ctx, task, &task_input, &vars)
                .await;

            let (outcome, errored) = match attempt_result {
                Ok(outcome) => (outcome, false),
                Err(task_error) => {
                    if !task.transition.has_error_branch() {
                        return Err(ChainError::TaskFailed {
                            task_id: task.id.clone(),
                            source: task_error,
                        });
                    }
                    warn!(task = %task.id, error = %task_error, "task failed; taking error branch");
                    (
                        TaskOutcome {
                            output: TypedValue::string(task_error.to_string()),
                            transition: "error".to_string(),
                        },
                        true,
                    )
                }
            };

            let output = self.compose(task, outcome.output, &vars)?;
            if task.print {
                info!(task = %task.id, output = %output.value, "task output");
            }

            let branch = select_branch(&task.transition, &outcome.transition, errored).ok_or_else(|| {
                ChainError::NoTransitionMatched {
                    task_id: task.id.clone(),
                    signal: outcome.transition.clone(),
                }
            })?;

            if ctx.debug {
                steps.push(StepTrace {
                    task_id: task.id.clone(),
                    input_type: task_input.data_type,
                    output_type: output.data_type,
                    transition: outcome.transition.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
            debug!(task = %task.id, transition = %outcome.transition, goto = %branch.goto, "task finished");

            vars.insert(task.id.clone(), output.clone());

            match branch.goto.as_str() {
                TERM_END => {
                    return Ok(ChainResult { output, steps });
                }
                TERM_ERROR => {
                    return Err(ChainError::Terminated {
                        task_id: task.id.clone(),
                        message: output
                            .render_string()
                            .unwrap_or_else(|| output.value.to_string()),
                    });
                }
                next => {
                    previous = output;
                    current_id = next.to_string();
                }
            }
        }
    }

    /// Resolves every hook referenced by the chain into tools once, before
    /// execution starts.
    async fn build_context(
        &self,
        chain: &ChainDefinition,
        client_tools: Vec<ToolDefinition>,
    ) -> Result<ChainContext, ChainError> {
        let mut ctx = ChainContext::new(chain.debug, chain.token_limit);
        ctx.client_tools = client_tools;

        for task in &chain.tasks {
            let Some(cfg) = &task.execute_config else { continue };
            for hook_name in &cfg.hooks {
                if ctx.hook_tools.contains_key(hook_name) {
                    continue;
                }
                let tools = self
                    .hooks
                    .tools_for_hook(hook_name)
                    .await
                    .map_err(|source| ChainError::HookResolution {
                        hook: hook_name.clone(),
                        source,
                    })?;
                for tool in &tools {
                    ctx.tool_resolutions
                        .entry(tool.function.name.clone())
                        .or_insert_with(|| ResolvedTool {
                            tool: tool.clone(),
                            hook_name: hook_name.clone(),
                        });
                }
                ctx.hook_tools.insert(hook_name.clone(), tools);
            }
        }
        Ok(ctx)
    }

    fn task_input(
        &self,
        task: &TaskDefinition,
        vars: &HashMap<String, TypedValue>,
        previous: &TypedValue,
    ) -> Result<TypedValue, ChainError> {
        if task.input_var.is_empty() {
            return Ok(previous.clone());
        }
        vars.get(&task.input_var)
            .cloned()
            .ok_or_else(|| ChainError::MissingVariable {
                task_id: task.id.clone(),
                var: task.input_var.clone(),
            })
    }

    async fn run_with_retry(
        &self,
        cancel: &CancellationToken,
        ctx: &ChainContext,
        task: &TaskDefinition,
        task_input: &TypedValue,
        vars: &HashMap<String, TypedValue>,
    ) -> Result<TaskOutcome, TaskError> {
        let mut attempts_left = task.retry_on_failure;
        loop {
            let rendered = if task.prompt_template.is_empty() {
                None
            } else {
                Some(template::render(&task.prompt_template, vars)?)
            };
            let result = self
                .executor
                .execute(cancel, ctx, task, task_input, rendered.as_deref())
                .await;
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(TaskError::Cancelled) => return Err(TaskError::Cancelled),
                Err(e) if attempts_left > 0 => {
                    attempts_left -= 1;
                    warn!(task = %task.id, error = %e, attempts_left, "retrying task");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Applies the task's compose spec: merge the output with another
    /// variable before it is stored.
    fn compose(
        &self,
        task: &TaskDefinition,
        output: TypedValue,
        vars: &HashMap<String, TypedValue>,
    ) -> Result<TypedValue, ChainError> {
        let Some(compose) = &task.compose else {
            return Ok(output);
        };
        let other = vars
            .get(&compose.with_var)
            .ok_or_else(|| ChainError::MissingVariable {
                task_id: task.id.clone(),
                var: compose.with_var.clone(),
            })?;

        match compose.strategy.as_str() {
            "chat_append" => {
                let mut history = other.as_chat_history().unwrap_or_default();
                let text = output
                    .render_string()
                    .unwrap_or_else(|| output.value.to_string());
                history.messages.push(crate::history::ChatMessage::user(text));
                TypedValue::chat_history(&history)
                    .map_err(|e| ChainError::Internal(format!("compose chat_append: {e}")))
            }
            // "" and "string_concat": validated upstream.
            _ => {
                let left = other
                    .render_string()
                    .unwrap_or_else(|| other.value.to_string());
                let right = output
                    .render_string()
                    .unwrap_or_else(|| output.value.to_string());
                Ok(TypedValue::string(format!("{left}\n{right}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ChatMessage;
    use crate::tasks::test_support::{executor_with, FakeClient};
    use crate::value::DataType;
    use chain_spec_core::TaskHandler;

    fn engine_with(client: Arc<FakeClient>) -> ChainEngine {
        let hooks = Arc::new(MultiHookRepo::new(vec![Arc::new(crate::hooks::PrintHook)]));
        ChainEngine::new(executor_with(client), hooks)
    }

    fn chain_json(json: &str) -> ChainDefinition {
        serde_json::from_str(json).expect("test chain parses")
    }

    /// **Scenario** (spec e2e 1): linear chain — template renders the input,
    /// the chain returns the model reply as a string.
    #[tokio::test]
    async fn linear_echo_chain() {
        let engine = engine_with(Arc::new(FakeClient::replying(&["Echo: hi"])));
        let chain = chain_json(
            r#"{
                "id": "echo",
                "tasks": [{
                    "id": "t1",
                    "handler": "prompt_to_string",
                    "prompt_template": "Echo: {{ input }}",
                    "transition": {"branches": [{"operator": "default", "goto": "end"}]}
                }]
            }"#,
        );
        let result = engine
            .execute(
                &CancellationToken::new(),
                &chain,
                TypedValue::string("hi"),
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(result.output.value, serde_json::json!("Echo: hi"));
        assert_eq!(result.output.data_type, DataType::String);
    }

    /// **Scenario** (spec e2e 2): conditional branch — "yes" maps to true and
    /// routes to t2.
    #[tokio::test]
    async fn conditional_branch_routes_on_condition() {
        let engine = engine_with(Arc::new(FakeClient::replying(&["yes", "done"])));
        let chain = chain_json(
            r#"{
                "id": "cond",
                "tasks": [
                    {
                        "id": "t1",
                        "handler": "prompt_to_condition",
                        "valid_conditions": {"yes": true, "no": false},
                        "transition": {"branches": [
                            {"operator": "equals", "when": "true", "goto": "t2"},
                            {"operator": "equals", "when": "false", "goto": "end"}
                        ]}
                    },
                    {
                        "id": "t2",
                        "handler": "prompt_to_string",
                        "input_var": "input",
                        "transition": {"branches": [{"operator": "default", "goto": "end"}]}
                    }
                ]
            }"#,
        );
        let result = engine
            .execute(
                &CancellationToken::new(),
                &chain,
                TypedValue::string("proceed?"),
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(result.output.value, serde_json::json!("done"));
    }

    /// **Scenario** (spec e2e 3): tool-call loop — chat produces a print tool
    /// call, execute_tool_calls appends the tool message, the follow-up chat
    /// ends the chain.
    #[tokio::test]
    async fn tool_call_loop() {
        let client = Arc::new(FakeClient::replying(&["calling print", "all done"]));
        client.tool_calls.lock().unwrap().push(vec![crate::history::ToolCall {
            id: "call_1".into(),
            call_type: "function".into(),
            function: crate::history::FunctionCall {
                name: "print".into(),
                arguments: r#"{"message":"ok"}"#.into(),
            },
        }]);
        let engine = engine_with(client);
        let chain = chain_json(
            r#"{
                "id": "tools",
                "debug": true,
                "tasks": [
                    {
                        "id": "t1",
                        "handler": "chat_completion",
                        "execute_config": {"hooks": ["print"]},
                        "transition": {"branches": [
                            {"operator": "equals", "when": "tool-call", "goto": "t2"},
                            {"operator": "equals", "when": "executed", "goto": "end"}
                        ]}
                    },
                    {
                        "id": "t2",
                        "handler": "execute_tool_calls",
                        "transition": {"branches": [
                            {"operator": "equals", "when": "tools_executed", "goto": "t3"},
                            {"operator": "default", "goto": "end"}
                        ]}
                    },
                    {
                        "id": "t3",
                        "handler": "chat_completion",
                        "transition": {"branches": [
                            {"operator": "equals", "when": "tool-call", "goto": "t2"},
                            {"operator": "equals", "when": "executed", "goto": "end"}
                        ]}
                    }
                ]
            }"#,
        );

        let mut history = crate::history::ChatHistory::default();
        history.messages.push(ChatMessage::user("please print ok"));
        let input = TypedValue::chat_history(&history).unwrap();

        let result = engine
            .execute(&CancellationToken::new(), &chain, input, vec![])
            .await
            .unwrap();

        let final_history = result.output.as_chat_history().unwrap();
        let tool_msg = final_history
            .messages
            .iter()
            .find(|m| m.role == "tool")
            .expect("tool message appended");
        assert_eq!(tool_msg.content, "ok");
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(final_history.messages.last().unwrap().content, "all done");

        // Debug trace records each step in task order.
        let ids: Vec<&str> = result.steps.iter().map(|s| s.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
        assert_eq!(result.steps[0].transition, "tool-call");
        assert_eq!(result.steps[1].transition, "tools_executed");
        assert_eq!(result.steps[2].transition, "executed");
    }

    /// **Scenario**: a task failure takes the error branch; the error message
    /// becomes the branch target's input.
    #[tokio::test]
    async fn error_branch_recovers() {
        // prompt_to_int gets a non-numeric reply and fails.
        let engine = engine_with(Arc::new(FakeClient::replying(&["not a number", "recovered"])));
        let chain = chain_json(
            r#"{
                "id": "recover",
                "tasks": [
                    {
                        "id": "t1",
                        "handler": "prompt_to_int",
                        "transition": {"branches": [
                            {"operator": "default", "goto": "end"},
                            {"operator": "error", "goto": "t2"}
                        ]}
                    },
                    {
                        "id": "t2",
                        "handler": "prompt_to_string",
                        "transition": {"branches": [{"operator": "default", "goto": "end"}]}
                    }
                ]
            }"#,
        );
        let result = engine
            .execute(
                &CancellationToken::new(),
                &chain,
                TypedValue::string("count"),
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(result.output.value, serde_json::json!("recovered"));
    }

    #[tokio::test]
    async fn failure_without_error_branch_terminates() {
        let engine = engine_with(Arc::new(FakeClient::replying(&["not a number"])));
        let chain = chain_json(
            r#"{
                "id": "fail",
                "tasks": [{
                    "id": "t1",
                    "handler": "prompt_to_int",
                    "transition": {"branches": [{"operator": "default", "goto": "end"}]}
                }]
            }"#,
        );
        let err = engine
            .execute(
                &CancellationToken::new(),
                &chain,
                TypedValue::string("count"),
                vec![],
            )
            .await
            .unwrap_err();
        match err {
            ChainError::TaskFailed { task_id, .. } => assert_eq!(task_id, "t1"),
            other => panic!("expected TaskFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_sentinel_terminates_with_failure() {
        let engine = engine_with(Arc::new(FakeClient::default()));
        let chain = chain_json(
            r#"{
                "id": "sentinel",
                "tasks": [{
                    "id": "t1",
                    "handler": "noop",
                    "transition": {"branches": [{"operator": "default", "goto": "error"}]}
                }]
            }"#,
        );
        let err = engine
            .execute(
                &CancellationToken::new(),
                &chain,
                TypedValue::string("x"),
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Terminated { .. }));
    }

    #[tokio::test]
    async fn retry_on_failure_retries_the_handler() {
        // First reply unparsable, second parses; one retry configured.
        let engine = engine_with(Arc::new(FakeClient::replying(&["nope", "7"])));
        let chain = chain_json(
            r#"{
                "id": "retry",
                "tasks": [{
                    "id": "t1",
                    "handler": "prompt_to_int",
                    "retry_on_failure": 1,
                    "transition": {"branches": [{"operator": "default", "goto": "end"}]}
                }]
            }"#,
        );
        let result = engine
            .execute(
                &CancellationToken::new(),
                &chain,
                TypedValue::string("count"),
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(result.output.value, serde_json::json!(7));
    }

    /// **Scenario**: templates address nested JSON from earlier task outputs
    /// by variable name.
    #[tokio::test]
    async fn template_reads_nested_prior_output() {
        let engine = engine_with(Arc::new(FakeClient::replying(&[
            r#"city=Lisbon, country=PT"#,
            "Lisbon noted",
        ])));
        let chain = chain_json(
            r#"{
                "id": "nested",
                "tasks": [
                    {
                        "id": "get_data",
                        "handler": "parse_key_value",
                        "transition": {"branches": [{"operator": "default", "goto": "t2"}]}
                    },
                    {
                        "id": "t2",
                        "handler": "prompt_to_string",
                        "prompt_template": "City is {{ get_data.city }}",
                        "transition": {"branches": [{"operator": "default", "goto": "end"}]}
                    }
                ]
            }"#,
        );
        let result = engine
            .execute(
                &CancellationToken::new(),
                &chain,
                TypedValue::string("city=Lisbon, country=PT"),
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(result.output.value, serde_json::json!("Lisbon noted"));
    }

    #[tokio::test]
    async fn unknown_input_var_is_an_error() {
        let engine = engine_with(Arc::new(FakeClient::default()));
        let chain = chain_json(
            r#"{
                "id": "missing-var",
                "tasks": [{
                    "id": "t1",
                    "handler": "noop",
                    "input_var": "ghost",
                    "transition": {"branches": [{"operator": "default", "goto": "end"}]}
                }]
            }"#,
        );
        let err = engine
            .execute(
                &CancellationToken::new(),
                &chain,
                TypedValue::string("x"),
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::MissingVariable { .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_the_chain() {
        let engine = engine_with(Arc::new(FakeClient::default()));
        let chain = chain_json(
            r#"{
                "id": "c",
                "tasks": [{
                    "id": "t1",
                    "handler": "noop",
                    "transition": {"branches": [{"operator": "default", "goto": "end"}]}
                }]
            }"#,
        );
        let token = CancellationToken::new();
        token.cancel();
        let err = engine
            .execute(&token, &chain, TypedValue::string("x"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Cancelled));
    }

    #[tokio::test]
    async fn invalid_chain_rejected_before_execution() {
        let engine = engine_with(Arc::new(FakeClient::default()));
        let chain = ChainDefinition {
            id: "bad".into(),
            description: String::new(),
            token_limit: 0,
            debug: false,
            tasks: vec![],
        };
        let err = engine
            .execute(
                &CancellationToken::new(),
                &chain,
                TypedValue::string("x"),
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Validation(ValidationError::EmptyChain)));
    }

    /// **Scenario**: compose merges the task output with another variable.
    #[tokio::test]
    async fn compose_string_concat() {
        let engine = engine_with(Arc::new(FakeClient::replying(&["part two"])));
        let chain = chain_json(
            r#"{
                "id": "compose",
                "tasks": [{
                    "id": "t1",
                    "handler": "prompt_to_string",
                    "compose": {"with_var": "input", "strategy": "string_concat"},
                    "transition": {"branches": [{"operator": "default", "goto": "end"}]}
                }]
            }"#,
        );
        let result = engine
            .execute(
                &CancellationToken::new(),
                &chain,
                TypedValue::string("part one"),
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(result.output.value, serde_json::json!("part one\npart two"));
    }
}
