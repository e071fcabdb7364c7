//! Minimal `.env` parser: `KEY=VALUE` lines, `#` comments, optional quoting.

use std::collections::HashMap;
use std::path::Path;

fn dotenv_path(override_dir: Option<&Path>) -> Option<std::path::PathBuf> {
    let dir = override_dir
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())?;
    let path = dir.join(".env");
    path.is_file().then_some(path)
}

/// Parses `.env` content. Double-quoted values support `\"`; single-quoted
/// values are stripped verbatim. No multiline values.
fn parse(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        let raw = v.trim();
        let value = if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
            raw[1..raw.len() - 1].replace("\\\"", "\"")
        } else if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
            raw[1..raw.len() - 1].to_string()
        } else {
            raw.to_string()
        };
        out.insert(key.to_string(), value);
    }
    out
}

/// Loads `.env` from `override_dir` or the current directory. A missing file
/// is not an error; it yields an empty map.
pub fn load(override_dir: Option<&Path>) -> std::io::Result<HashMap<String, String>> {
    let Some(path) = dotenv_path(override_dir) else {
        return Ok(HashMap::new());
    };
    Ok(parse(&std::fs::read_to_string(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_quoted_pairs() {
        let m = parse("A=1\nB=\"two words\"\nC='three'\n");
        assert_eq!(m.get("A").map(String::as_str), Some("1"));
        assert_eq!(m.get("B").map(String::as_str), Some("two words"));
        assert_eq!(m.get("C").map(String::as_str), Some("three"));
    }

    #[test]
    fn skips_comments_blank_lines_and_bad_keys() {
        let m = parse("# c\n\n=nokey\nnot a pair\nK=v\n");
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("K").map(String::as_str), Some("v"));
    }

    #[test]
    fn escaped_quotes_unescaped() {
        let m = parse(r#"K="say \"hi\"""#);
        assert_eq!(m.get("K").map(String::as_str), Some("say \"hi\""));
    }

    #[test]
    fn missing_file_yields_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(dir.path())).unwrap().is_empty());
    }

    #[test]
    fn reads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "X=42\n").unwrap();
        let m = load(Some(dir.path())).unwrap();
        assert_eq!(m.get("X").map(String::as_str), Some("42"));
    }
}
