//! Per-execution chain context: immutable wiring plus the token budget.
//!
//! One context per chain run; never shared across executions. The variable
//! map lives in the engine loop, not here, because handlers only see their
//! rendered input.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

use crate::hooks::ResolvedTool;
use crate::provider::ToolDefinition;
use crate::value::DataType;

/// Immutable execution wiring, shared by reference with every task.
pub struct ChainContext {
    pub debug: bool,
    /// Combined token budget for the run; 0 disables enforcement.
    pub token_limit: i64,
    /// Tools supplied by the caller, offered when `pass_client_tools` is set.
    pub client_tools: Vec<ToolDefinition>,
    /// Tools per hook name, resolved once at validation.
    pub hook_tools: HashMap<String, Vec<ToolDefinition>>,
    /// Tool function name → resolution record.
    pub tool_resolutions: HashMap<String, ResolvedTool>,
    pub started_at: DateTime<Utc>,
    used_tokens: AtomicI64,
}

impl ChainContext {
    pub fn new(debug: bool, token_limit: i64) -> Self {
        Self {
            debug,
            token_limit,
            client_tools: Vec::new(),
            hook_tools: HashMap::new(),
            tool_resolutions: HashMap::new(),
            started_at: Utc::now(),
            used_tokens: AtomicI64::new(0),
        }
    }

    /// Records `count` consumed tokens. Returns the new total, or an error
    /// when the budget is exhausted.
    pub fn charge_tokens(&self, count: u32) -> Result<i64, BudgetExceeded> {
        let total = self.used_tokens.fetch_add(count as i64, Ordering::SeqCst) + count as i64;
        if self.token_limit > 0 && total > self.token_limit {
            return Err(BudgetExceeded {
                used: total,
                limit: self.token_limit,
            });
        }
        Ok(total)
    }

    pub fn used_tokens(&self) -> i64 {
        self.used_tokens.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetExceeded {
    pub used: i64,
    pub limit: i64,
}

/// One step of the debug trace.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepTrace {
    pub task_id: String,
    pub input_type: DataType,
    pub output_type: DataType,
    pub transition: String,
    pub duration_ms: u64,
}
