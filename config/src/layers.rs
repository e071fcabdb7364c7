//! Merges the three configuration layers into one map.
//!
//! Priority when the same key appears in several layers:
//! process env > project `.env` > XDG `config.toml` `[env]` table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::{dotenv, ConfigError, APP_NAME};

#[derive(serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    env: HashMap<String, String>,
}

fn xdg_config_path() -> Option<PathBuf> {
    // Honor an explicit XDG_CONFIG_HOME before falling back to the platform dir.
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(dirs::config_dir)?;
    let path = base.join(APP_NAME).join("config.toml");
    path.is_file().then_some(path)
}

fn load_xdg() -> Result<HashMap<String, String>, ConfigError> {
    let Some(path) = xdg_config_path() else {
        return Ok(HashMap::new());
    };
    let content = std::fs::read_to_string(&path).map_err(ConfigError::TomlRead)?;
    let file: ConfigFile = toml::from_str(&content)?;
    Ok(file.env)
}

/// Produces the merged key-value view of all three layers. Only keys present
/// in at least one layer appear; process env values win.
pub fn merged_env(override_dir: Option<&Path>) -> Result<HashMap<String, String>, ConfigError> {
    let xdg = load_xdg()?;
    let dotenv = dotenv::load(override_dir).map_err(ConfigError::DotenvRead)?;

    let mut merged = xdg;
    merged.extend(dotenv);
    let keys: Vec<String> = merged.keys().cloned().collect();
    for key in keys {
        if let Ok(v) = std::env::var(&key) {
            merged.insert(key, v);
        }
    }
    // Process-env keys with the taskweave prefix apply even without a file entry.
    for (key, value) in std::env::vars() {
        if key.starts_with("TASKWEAVE_") {
            merged.insert(key, value);
        }
    }
    Ok(merged)
}
