//! Typed parsing of model responses: ints, floats, ranges, conditions,
//! key-value pairs, transition commands, and JS normalization.
//!
//! Model output is messy; every parser trims whitespace and surrounding
//! quotes before interpreting.

use std::collections::HashMap;

/// Strips whitespace and one layer of matching quotes.
fn clean(s: &str) -> &str {
    let s = s.trim();
    for quote in ['"', '\'', '`'] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].trim();
        }
    }
    s
}

pub fn parse_int(s: &str) -> Result<i64, String> {
    let cleaned = clean(s).trim_end_matches('.');
    cleaned
        .parse::<i64>()
        .map_err(|_| format!("not an integer: {s:?}"))
}

pub fn parse_float(s: &str) -> Result<f64, String> {
    let cleaned = clean(s).trim_end_matches('.');
    cleaned
        .parse::<f64>()
        .map_err(|_| format!("not a number: {s:?}"))
}

/// Parses `"a"` (normalized to `"a-a"`) or `"a-b"`. Both parts must be
/// numeric; negative bounds keep their sign.
pub fn parse_range(s: &str) -> Result<String, String> {
    let cleaned = clean(s);
    if cleaned.is_empty() {
        return Err("empty range".to_string());
    }

    // Split on the first '-' that is not a leading sign.
    let split_at = cleaned
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '-')
        .map(|(i, _)| i);

    let (low, high) = match split_at {
        Some(i) => (&cleaned[..i], &cleaned[i + 1..]),
        None => (cleaned, cleaned),
    };
    let low = low.trim();
    let high = high.trim();
    low.parse::<f64>().map_err(|_| format!("bad range start: {low:?}"))?;
    high.parse::<f64>().map_err(|_| format!("bad range end: {high:?}"))?;
    Ok(format!("{low}-{high}"))
}

/// Maps a model reply through the task's accepted condition strings. The
/// comparison is case-insensitive after trimming; a bare `"yes"` stays true
/// even when the map omits it.
pub fn parse_condition(
    response: &str,
    valid_conditions: &HashMap<String, bool>,
) -> Result<bool, String> {
    let cleaned = clean(response);
    for (key, value) in valid_conditions {
        if key.eq_ignore_ascii_case(cleaned) {
            return Ok(*value);
        }
    }
    if cleaned == "yes" {
        return Ok(true);
    }
    Err(format!(
        "response {cleaned:?} does not match any accepted condition"
    ))
}

/// Extracts the command of a leading-slash input: `"/approve now"` yields
/// `"approve"`; anything without the slash yields `"pass"`.
pub fn parse_transition_command(s: &str) -> String {
    let trimmed = s.trim();
    match trimmed.strip_prefix('/') {
        Some(rest) => rest
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string(),
        None => "pass".to_string(),
    }
}

/// Parses `k=v` pairs separated by commas into a JSON object. Values are
/// typed: integers, floats, and booleans are recognized, quoted strings are
/// unquoted, everything else stays a string.
pub fn parse_key_value(s: &str) -> Result<serde_json::Value, String> {
    let mut object = serde_json::Map::new();
    for pair in s.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("not a key=value pair: {pair:?}"))?;
        let key = clean(key);
        if key.is_empty() {
            return Err(format!("empty key in pair: {pair:?}"));
        }
        object.insert(key.to_string(), type_value(value));
    }
    if object.is_empty() {
        return Err("no key=value pairs found".to_string());
    }
    Ok(serde_json::Value::Object(object))
}

fn type_value(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    // A quoted value is a string verbatim, no further inference.
    for quote in ['"', '\''] {
        if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
            return serde_json::Value::String(trimmed[1..trimmed.len() - 1].to_string());
        }
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return serde_json::Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return serde_json::Value::from(f);
    }
    match trimmed {
        "true" => serde_json::Value::Bool(true),
        "false" => serde_json::Value::Bool(false),
        other => serde_json::Value::String(other.to_string()),
    }
}

/// Strips Markdown code fences (with an optional language tag).
pub fn strip_code_fences(s: &str) -> String {
    let trimmed = s.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    // Drop a language tag on the opening fence line.
    let body = match rest.split_once('\n') {
        Some((first_line, body)) if !first_line.trim().contains(' ') => body,
        _ => rest,
    };
    body.trim().to_string()
}

/// Normalizes an LLM's JS answer: strip fences, and when the result parses as
/// a JSON object with a string `code` field, use that field.
pub fn normalize_js(s: &str) -> String {
    let stripped = strip_code_fences(s);
    if let Ok(serde_json::Value::Object(obj)) = serde_json::from_str(&stripped) {
        if let Some(code) = obj.get("code").and_then(|v| v.as_str()) {
            return code.to_string();
        }
    }
    stripped
}
