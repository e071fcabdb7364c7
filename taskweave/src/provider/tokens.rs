//! Token counting behind a trait so tests can substitute exact counters.

use crate::history::ChatHistory;

/// Counts prompt tokens for budget checks. Implementations may be
/// model-specific; the default is a character heuristic.
pub trait TokenCounter: Send + Sync {
    fn count(&self, model: &str, text: &str) -> u32;

    /// Sums per-message counts with a fixed per-message overhead, unless the
    /// history carries trusted cached counts.
    fn count_history(&self, model: &str, history: &ChatHistory) -> u32 {
        if history.input_tokens > 0 && history.output_tokens > 0 {
            return history.input_tokens + history.output_tokens;
        }
        history
            .messages
            .iter()
            .map(|m| self.count(model, &m.content) + PER_MESSAGE_OVERHEAD)
            .sum()
    }
}

/// Role/format framing cost per message.
const PER_MESSAGE_OVERHEAD: u32 = 4;

/// Rough estimate: one token per four characters, rounded up.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, _model: &str, text: &str) -> u32 {
        (text.chars().count() as u32).div_ceil(4)
    }
}
