//! Transition branches: how the engine picks the next task after a handler runs.

use serde::{Deserialize, Serialize};

/// Terminal sentinel: the chain ends successfully, returning the last output.
pub const TERM_END: &str = "end";

/// Terminal sentinel: the chain ends with a failure.
pub const TERM_ERROR: &str = "error";

/// Comparison applied between a branch's `when` value and the handler's
/// transition signal. Branches are evaluated in declaration order; the first
/// match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOperator {
    /// Signal equals `when` (exact string compare).
    Equals,
    /// Signal contains `when` as a substring.
    Contains,
    /// Both parse as numbers and signal > `when`.
    Gt,
    /// Both parse as numbers and signal < `when`.
    Lt,
    /// `when` is a range `"a-b"` and the numeric signal falls inside it,
    /// or the signal is itself a range contained in `when`.
    InRange,
    /// Always matches. Evaluated like any other branch, so place it last.
    Default,
    /// Matches only when the handler returned an error.
    Error,
}

/// One branch of a task transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionBranch {
    pub operator: TransitionOperator,
    /// Comparison operand. Ignored for `default` and `error`.
    #[serde(default)]
    pub when: String,
    /// Target task id, or one of the sentinels [`TERM_END`] / [`TERM_ERROR`].
    pub goto: String,
}

/// Ordered branch list attached to every task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskTransition {
    #[serde(default)]
    pub branches: Vec<TransitionBranch>,
}

impl TaskTransition {
    /// Convenience constructor for a single unconditional branch.
    pub fn default_to(goto: impl Into<String>) -> Self {
        Self {
            branches: vec![TransitionBranch {
                operator: TransitionOperator::Default,
                when: String::new(),
                goto: goto.into(),
            }],
        }
    }

    /// True when any branch has the `error` operator.
    pub fn has_error_branch(&self) -> bool {
        self.branches
            .iter()
            .any(|b| b.operator == TransitionOperator::Error)
    }
}

/// True when `target` names a terminal sentinel rather than a task id.
pub fn is_terminal(target: &str) -> bool {
    target == TERM_END || target == TERM_ERROR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_to_builds_single_branch() {
        let t = TaskTransition::default_to(TERM_END);
        assert_eq!(t.branches.len(), 1);
        assert_eq!(t.branches[0].operator, TransitionOperator::Default);
        assert_eq!(t.branches[0].goto, "end");
    }

    #[test]
    fn terminal_detection() {
        assert!(is_terminal("end"));
        assert!(is_terminal("error"));
        assert!(!is_terminal("t2"));
    }

    /// **Scenario**: operators use snake_case names in JSON, and `when` may be omitted.
    #[test]
    fn branch_deserializes_without_when() {
        let b: TransitionBranch =
            serde_json::from_str(r#"{"operator":"default","goto":"end"}"#).unwrap();
        assert_eq!(b.operator, TransitionOperator::Default);
        assert!(b.when.is_empty());
    }

    #[test]
    fn has_error_branch_detects_error_operator() {
        let t: TaskTransition = serde_json::from_str(
            r#"{"branches":[{"operator":"equals","when":"x","goto":"t2"},
                            {"operator":"error","goto":"end"}]}"#,
        )
        .unwrap();
        assert!(t.has_error_branch());
    }
}
