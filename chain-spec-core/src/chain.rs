//! Chain and task definitions: the declarative workflow shape.
//!
//! A chain is a list of tasks with branching transitions. Definitions are
//! immutable during a single execution; the engine validates once with
//! [`crate::validate_chain`] and then interprets.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::handler::TaskHandler;
use crate::transition::TaskTransition;

/// Model/provider selection and tool wiring for one LLM-backed task.
///
/// `model`/`models` and `provider`/`providers` are alternatives: the singular
/// field is shorthand for a one-element list and must not be combined with
/// the plural form (validation rejects that).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Client-tool names withheld from the model for this task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hide_tools: Vec<String>,
    /// When true, tools supplied by the caller are offered to the model.
    #[serde(default)]
    pub pass_client_tools: bool,
    /// Hook names whose tools are offered to the model for this task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<String>,
}

impl ExecuteConfig {
    /// Effective model-name filter: singular and plural forms merged.
    pub fn model_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(m) = &self.model {
            names.push(m.clone());
        }
        names.extend(self.models.iter().cloned());
        names
    }

    /// Effective provider-type filter: singular and plural forms merged.
    pub fn provider_types(&self) -> Vec<String> {
        let mut types = Vec::new();
        if let Some(p) = &self.provider {
            types.push(p.clone());
        }
        types.extend(self.providers.iter().cloned());
        types
    }
}

/// A hook invocation spec: the named capability plus static string arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub args: HashMap<String, String>,
}

/// Merges the task output with another chain variable before it is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeSpec {
    /// Name of the variable to merge with.
    pub with_var: String,
    /// Merge strategy: `"string_concat"` or `"chat_append"`.
    #[serde(default)]
    pub strategy: String,
}

/// One step of a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique within the chain; branch `goto` targets reference this.
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub handler: TaskHandler,
    /// Variable fed to the handler when no `prompt_template` is set. Empty
    /// means "output of the previous task".
    #[serde(default)]
    pub input_var: String,
    /// System instruction for LLM-backed handlers.
    #[serde(default)]
    pub system_instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_config: Option<ExecuteConfig>,
    /// Hook to invoke; required when `handler` is [`TaskHandler::Hook`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<HookSpec>,
    /// Template rendered against the variable map; the result becomes the
    /// handler input.
    #[serde(default)]
    pub prompt_template: String,
    /// Template rendered against the hook output to produce the transition
    /// signal for `hook` tasks.
    #[serde(default)]
    pub output_template: String,
    /// Accepted condition strings for `prompt_to_condition`, mapped to the
    /// boolean each one means.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub valid_conditions: HashMap<String, bool>,
    /// Extra handler attempts after a failure before the error branch (or
    /// chain failure) applies.
    #[serde(default)]
    pub retry_on_failure: u32,
    /// Log the task output at info level.
    #[serde(default)]
    pub print: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose: Option<ComposeSpec>,
    #[serde(default)]
    pub transition: TaskTransition,
}

/// A declarative workflow: tasks plus routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Combined token budget for every LLM-backed task; 0 disables the check.
    #[serde(default)]
    pub token_limit: i64,
    /// Emit a step trace during execution.
    #[serde(default)]
    pub debug: bool,
    pub tasks: Vec<TaskDefinition>,
}

impl ChainDefinition {
    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == id)
    }
}
