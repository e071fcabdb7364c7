//! Runtime configuration for taskweave.
//!
//! Settings are read from three layers with priority **process env > project
//! `.env` > `$XDG_CONFIG_HOME/taskweave/config.toml` `[env]` table**, then
//! parsed into a typed [`RuntimeConfig`]. Secrets (provider API keys) are held
//! as plain strings but are deliberately excluded from the `Debug` output.

mod dotenv;
mod layers;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

pub const APP_NAME: &str = "taskweave";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read config.toml: {0}")]
    TomlRead(std::io::Error),
    #[error("parse config.toml: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Typed runtime settings consumed by the taskweave services.
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Reconciler tick interval.
    pub reconcile_interval: Duration,
    /// Download orchestrator tick interval.
    pub download_interval: Duration,
    /// Function-cache sync interval.
    pub function_sync_interval: Duration,
    /// When true, the reconciler aggregates declared models per affinity group.
    pub affinity_aware: bool,
    /// Deploy policy: leave undeclared models on ollama backends in place.
    pub skip_delete_undeclared: bool,
    /// Enable the local_exec hook (off unless explicitly requested).
    pub local_exec_enabled: bool,
    /// Allowlisted commands for the local_exec hook.
    pub local_exec_allowlist: Vec<String>,
    /// Denylisted commands for the local_exec hook; always enforced.
    pub local_exec_denylist: Vec<String>,
    /// Chain token budget applied when a chain declares none. 0 disables.
    pub default_token_limit: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            download_interval: Duration::from_secs(5),
            function_sync_interval: Duration::from_secs(60),
            affinity_aware: false,
            skip_delete_undeclared: false,
            local_exec_enabled: false,
            local_exec_allowlist: Vec::new(),
            local_exec_denylist: vec!["rm".into(), "shutdown".into(), "reboot".into()],
            default_token_limit: 0,
        }
    }
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("reconcile_interval", &self.reconcile_interval)
            .field("download_interval", &self.download_interval)
            .field("function_sync_interval", &self.function_sync_interval)
            .field("affinity_aware", &self.affinity_aware)
            .field("skip_delete_undeclared", &self.skip_delete_undeclared)
            .field("local_exec_enabled", &self.local_exec_enabled)
            .field("default_token_limit", &self.default_token_limit)
            .finish()
    }
}

impl RuntimeConfig {
    /// Loads configuration from the three layers. `override_dir`, when given,
    /// is searched for `.env` instead of the current directory.
    pub fn load(override_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let merged = layers::merged_env(override_dir)?;
        Self::from_map(&merged)
    }

    /// Builds a config from an explicit key-value map. Exposed for tests and
    /// for embedding callers that manage their own environment.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut cfg = RuntimeConfig::default();

        if let Some(v) = map.get("TASKWEAVE_RECONCILE_INTERVAL_SECS") {
            cfg.reconcile_interval = Duration::from_secs(parse_u64("TASKWEAVE_RECONCILE_INTERVAL_SECS", v)?);
        }
        if let Some(v) = map.get("TASKWEAVE_DOWNLOAD_INTERVAL_SECS") {
            cfg.download_interval = Duration::from_secs(parse_u64("TASKWEAVE_DOWNLOAD_INTERVAL_SECS", v)?);
        }
        if let Some(v) = map.get("TASKWEAVE_FUNCTION_SYNC_INTERVAL_SECS") {
            cfg.function_sync_interval =
                Duration::from_secs(parse_u64("TASKWEAVE_FUNCTION_SYNC_INTERVAL_SECS", v)?);
        }
        if let Some(v) = map.get("TASKWEAVE_AFFINITY_AWARE") {
            cfg.affinity_aware = parse_bool("TASKWEAVE_AFFINITY_AWARE", v)?;
        }
        if let Some(v) = map.get("TASKWEAVE_SKIP_DELETE_UNDECLARED") {
            cfg.skip_delete_undeclared = parse_bool("TASKWEAVE_SKIP_DELETE_UNDECLARED", v)?;
        }
        if let Some(v) = map.get("TASKWEAVE_LOCAL_EXEC_ENABLED") {
            cfg.local_exec_enabled = parse_bool("TASKWEAVE_LOCAL_EXEC_ENABLED", v)?;
        }
        if let Some(v) = map.get("TASKWEAVE_LOCAL_EXEC_ALLOWLIST") {
            cfg.local_exec_allowlist = parse_list(v);
        }
        if let Some(v) = map.get("TASKWEAVE_LOCAL_EXEC_DENYLIST") {
            cfg.local_exec_denylist = parse_list(v);
        }
        if let Some(v) = map.get("TASKWEAVE_DEFAULT_TOKEN_LIMIT") {
            cfg.default_token_limit = parse_u64("TASKWEAVE_DEFAULT_TOKEN_LIMIT", v)? as i64;
        }

        Ok(cfg)
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
