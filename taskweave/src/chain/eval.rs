//! Branch selection: evaluate a task's transition branches against the
//! handler's signal, in declaration order. First match wins.

use chain_spec_core::{TaskTransition, TransitionBranch, TransitionOperator};

use crate::tasks::parse_range;

/// Picks the branch for a handler outcome. When `errored` is set only `error`
/// branches can match; otherwise every operator except `error` is evaluated
/// against the signal.
pub fn select_branch<'a>(
    transition: &'a TaskTransition,
    signal: &str,
    errored: bool,
) -> Option<&'a TransitionBranch> {
    transition
        .branches
        .iter()
        .find(|branch| matches(branch, signal, errored))
}

fn matches(branch: &TransitionBranch, signal: &str, errored: bool) -> bool {
    if errored {
        return branch.operator == TransitionOperator::Error;
    }
    match branch.operator {
        TransitionOperator::Error => false,
        TransitionOperator::Default => true,
        TransitionOperator::Equals => signal == branch.when,
        TransitionOperator::Contains => signal.contains(&branch.when),
        TransitionOperator::Gt => numeric(signal, &branch.when, |s, w| s > w),
        TransitionOperator::Lt => numeric(signal, &branch.when, |s, w| s < w),
        TransitionOperator::InRange => in_range(signal, &branch.when),
    }
}

fn numeric(signal: &str, when: &str, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (signal.trim().parse::<f64>(), when.trim().parse::<f64>()) {
        (Ok(s), Ok(w)) => cmp(s, w),
        _ => false,
    }
}

/// `when` is a range `"a-b"`; the signal matches when it is a number inside
/// it, or itself a range fully contained in it.
fn in_range(signal: &str, when: &str) -> bool {
    let Some((when_low, when_high)) = parse_bounds(when) else {
        return false;
    };
    if let Ok(value) = signal.trim().parse::<f64>() {
        return value >= when_low && value <= when_high;
    }
    if let Some((sig_low, sig_high)) = parse_bounds(signal) {
        return sig_low >= when_low && sig_high <= when_high;
    }
    false
}

fn parse_bounds(s: &str) -> Option<(f64, f64)> {
    let normalized = parse_range(s).ok()?;
    let idx = normalized
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '-')
        .map(|(i, _)| i)?;
    let low = normalized[..idx].parse::<f64>().ok()?;
    let high = normalized[idx + 1..].parse::<f64>().ok()?;
    Some((low, high))
}
