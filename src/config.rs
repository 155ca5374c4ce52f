use crate::state::StatePaths;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Hard ceiling on simultaneously running executor subprocesses.
    pub max_concurrent_tasks: usize,
    /// Wall-clock budget per invocation; 0 disables the timeout.
    pub task_timeout_secs: u64,
    pub executor_binary: String,
    pub default_model: String,
    /// Conversation ids containing this marker are shared across
    /// cooperating instances.
    pub shared_suffix: String,
    pub sandbox: SandboxSettings,
    pub lock: LockSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 20,
            task_timeout_secs: 0,
            executor_binary: "claude".to_string(),
            default_model: "sonnet".to_string(),
            shared_suffix: "@g".to_string(),
            sandbox: SandboxSettings::default(),
            lock: LockSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SandboxSettings {
    pub enabled: bool,
    pub image: String,
    pub memory: String,
    pub cpus: String,
    pub pids_limit: u32,
    pub storage_quota_bytes: u64,
    pub idle_timeout_secs: u64,
    /// Read-only credential overlay mounted into every container.
    pub credentials_dir: Option<PathBuf>,
    /// Host path of the executor binary mounted read-only inside.
    pub executor_path: Option<PathBuf>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "corral-agent:latest".to_string(),
            memory: "2g".to_string(),
            cpus: "1.0".to_string(),
            pids_limit: 256,
            storage_quota_bytes: 2 * 1024 * 1024 * 1024,
            idle_timeout_secs: 86_400,
            credentials_dir: None,
            executor_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LockSettings {
    pub group_ttl_secs: u64,
    pub mutex_stale_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            group_ttl_secs: 600,
            mutex_stale_secs: 5,
        }
    }
}

/// Loads `config.yaml` from the state root; a missing file yields the
/// built-in defaults.
pub fn load_settings(paths: &StatePaths) -> Result<Settings, ConfigError> {
    let path = paths.settings_file();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Settings::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    };
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}
