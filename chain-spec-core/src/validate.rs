//! Static chain validation, applied once before execution.
//!
//! Checks structure only; anything requiring runtime state (hook existence,
//! model availability) is the engine's concern.

use std::collections::HashSet;

use crate::chain::ChainDefinition;
use crate::handler::TaskHandler;
use crate::transition::{is_terminal, TransitionOperator};

/// Why a chain definition was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyChain,
    DuplicateTaskId(String),
    /// (task id, branch target)
    UnknownBranchTarget(String, String),
    /// Task has no branches at all.
    NoBranches(String),
    /// Task may produce a signal no branch covers and has no `default`.
    MissingDefaultBranch(String),
    /// Task uses the `hook` handler without a hook spec.
    MissingHookSpec(String),
    /// `model` combined with `models`, or `provider` with `providers`.
    ConflictingExecuteConfig(String),
    /// `compose.strategy` is not a supported strategy name.
    UnknownComposeStrategy(String, String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyChain => write!(f, "chain has no tasks"),
            ValidationError::DuplicateTaskId(id) => write!(f, "duplicate task id {id:?}"),
            ValidationError::UnknownBranchTarget(task, target) => {
                write!(f, "task {task:?} branches to unknown task {target:?}")
            }
            ValidationError::NoBranches(task) => write!(f, "task {task:?} has no branches"),
            ValidationError::MissingDefaultBranch(task) => {
                write!(f, "task {task:?} needs a default branch")
            }
            ValidationError::MissingHookSpec(task) => {
                write!(f, "task {task:?} uses the hook handler without a hook")
            }
            ValidationError::ConflictingExecuteConfig(task) => {
                write!(
                    f,
                    "task {task:?} sets both singular and plural model/provider fields"
                )
            }
            ValidationError::UnknownComposeStrategy(task, s) => {
                write!(f, "task {task:?} has unknown compose strategy {s:?}")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

const COMPOSE_STRATEGIES: &[&str] = &["", "string_concat", "chat_append"];

/// Validates a chain definition. Returns the first structural problem found.
pub fn validate_chain(chain: &ChainDefinition) -> Result<(), ValidationError> {
    if chain.tasks.is_empty() {
        return Err(ValidationError::EmptyChain);
    }

    let mut ids = HashSet::new();
    for task in &chain.tasks {
        if !ids.insert(task.id.as_str()) {
            return Err(ValidationError::DuplicateTaskId(task.id.clone()));
        }
    }

    for task in &chain.tasks {
        if task.transition.branches.is_empty() {
            // raise_error terminates the chain itself; branches are optional.
            if task.handler == TaskHandler::RaiseError {
                continue;
            }
            return Err(ValidationError::NoBranches(task.id.clone()));
        }

        for branch in &task.transition.branches {
            if !is_terminal(&branch.goto) && !ids.contains(branch.goto.as_str()) {
                return Err(ValidationError::UnknownBranchTarget(
                    task.id.clone(),
                    branch.goto.clone(),
                ));
            }
        }

        let has_default = task
            .transition
            .branches
            .iter()
            .any(|b| b.operator == TransitionOperator::Default);
        if !has_default {
            let covered = match task.handler.known_signals() {
                Some(signals) => signals.iter().all(|sig| {
                    task.transition.branches.iter().any(|b| {
                        b.operator == TransitionOperator::Equals && b.when == *sig
                    })
                }),
                None => false,
            };
            if !covered {
                return Err(ValidationError::MissingDefaultBranch(task.id.clone()));
            }
        }

        if task.handler == TaskHandler::Hook && task.hook.is_none() {
            return Err(ValidationError::MissingHookSpec(task.id.clone()));
        }

        if let Some(cfg) = &task.execute_config {
            if (cfg.model.is_some() && !cfg.models.is_empty())
                || (cfg.provider.is_some() && !cfg.providers.is_empty())
            {
                return Err(ValidationError::ConflictingExecuteConfig(task.id.clone()));
            }
        }

        if let Some(compose) = &task.compose {
            if !COMPOSE_STRATEGIES.contains(&compose.strategy.as_str()) {
                return Err(ValidationError::UnknownComposeStrategy(
                    task.id.clone(),
                    compose.strategy.clone(),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TaskDefinition;
    use crate::transition::{TaskTransition, TransitionBranch};

    fn task(id: &str, handler: TaskHandler, transition: TaskTransition) -> TaskDefinition {
        TaskDefinition {
            id: id.into(),
            description: String::new(),
            handler,
            input_var: String::new(),
            system_instruction: String::new(),
            execute_config: None,
            hook: None,
            prompt_template: String::new(),
            output_template: String::new(),
            valid_conditions: Default::default(),
            retry_on_failure: 0,
            print: false,
            compose: None,
            transition,
        }
    }

    fn chain(tasks: Vec<TaskDefinition>) -> ChainDefinition {
        ChainDefinition {
            id: "c".into(),
            description: String::new(),
            token_limit: 0,
            debug: false,
            tasks,
        }
    }

    #[test]
    fn empty_chain_rejected() {
        assert_eq!(validate_chain(&chain(vec![])), Err(ValidationError::EmptyChain));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let c = chain(vec![
            task("t1", TaskHandler::Noop, TaskTransition::default_to("end")),
            task("t1", TaskHandler::Noop, TaskTransition::default_to("end")),
        ]);
        assert_eq!(
            validate_chain(&c),
            Err(ValidationError::DuplicateTaskId("t1".into()))
        );
    }

    #[test]
    fn unknown_branch_target_rejected() {
        let c = chain(vec![task(
            "t1",
            TaskHandler::Noop,
            TaskTransition::default_to("t9"),
        )]);
        assert_eq!(
            validate_chain(&c),
            Err(ValidationError::UnknownBranchTarget("t1".into(), "t9".into()))
        );
    }

    /// **Scenario**: a condition task covering both known signals needs no default branch.
    #[test]
    fn full_signal_coverage_substitutes_for_default() {
        let transition = TaskTransition {
            branches: vec![
                TransitionBranch {
                    operator: TransitionOperator::Equals,
                    when: "true".into(),
                    goto: "end".into(),
                },
                TransitionBranch {
                    operator: TransitionOperator::Equals,
                    when: "false".into(),
                    goto: "end".into(),
                },
            ],
        };
        let c = chain(vec![task("t1", TaskHandler::PromptToCondition, transition)]);
        assert!(validate_chain(&c).is_ok());
    }

    /// **Scenario**: an open-ended handler (prompt_to_string) without a default branch is rejected.
    #[test]
    fn open_ended_handler_requires_default() {
        let transition = TaskTransition {
            branches: vec![TransitionBranch {
                operator: TransitionOperator::Equals,
                when: "x".into(),
                goto: "end".into(),
            }],
        };
        let c = chain(vec![task("t1", TaskHandler::PromptToString, transition)]);
        assert_eq!(
            validate_chain(&c),
            Err(ValidationError::MissingDefaultBranch("t1".into()))
        );
    }

    #[test]
    fn hook_handler_requires_hook_spec() {
        let c = chain(vec![task(
            "t1",
            TaskHandler::Hook,
            TaskTransition::default_to("end"),
        )]);
        assert_eq!(
            validate_chain(&c),
            Err(ValidationError::MissingHookSpec("t1".into()))
        );
    }

    #[test]
    fn raise_error_allows_empty_branches() {
        let c = chain(vec![task(
            "t1",
            TaskHandler::RaiseError,
            TaskTransition::default(),
        )]);
        assert!(validate_chain(&c).is_ok());
    }

    #[test]
    fn conflicting_execute_config_rejected() {
        let mut t = task(
            "t1",
            TaskHandler::PromptToString,
            TaskTransition::default_to("end"),
        );
        t.execute_config = Some(crate::chain::ExecuteConfig {
            model: Some("m1".into()),
            models: vec!["m2".into()],
            ..Default::default()
        });
        let c = chain(vec![t]);
        assert_eq!(
            validate_chain(&c),
            Err(ValidationError::ConflictingExecuteConfig("t1".into()))
        );
    }
}
