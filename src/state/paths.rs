use super::StateError;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![self.root.join("logs"), self.root.join("sandboxes")]
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn shared_document_path(&self) -> PathBuf {
        self.root.join("shared.json")
    }

    pub fn local_document_path(&self) -> PathBuf {
        self.root.join("local.json")
    }

    pub fn shared_lock_path(&self) -> PathBuf {
        self.root.join("shared.json.lock")
    }

    pub fn core_log_path(&self) -> PathBuf {
        self.root.join("logs/core.log")
    }

    pub fn sandbox_log_path(&self) -> PathBuf {
        self.root.join("logs/sandbox.log")
    }

    pub fn sandboxes_dir(&self) -> PathBuf {
        self.root.join("sandboxes")
    }

    pub fn sandbox_workspace_dir(&self, container_name: &str) -> PathBuf {
        self.sandboxes_dir().join(container_name).join("workspace")
    }

    pub fn sandbox_agent_state_dir(&self, container_name: &str) -> PathBuf {
        self.sandboxes_dir().join(container_name).join("agent-state")
    }
}

pub const DEFAULT_STATE_ROOT_DIR: &str = ".corral";

pub fn default_state_root_path() -> Result<PathBuf, StateError> {
    let home = std::env::var_os("HOME").ok_or(StateError::HomeDirectoryUnavailable)?;
    Ok(PathBuf::from(home).join(DEFAULT_STATE_ROOT_DIR))
}

pub fn bootstrap_state_root(paths: &StatePaths) -> Result<(), StateError> {
    for path in paths.required_directories() {
        fs::create_dir_all(&path).map_err(|source| StateError::CreateDir {
            path: path.display().to_string(),
            source,
        })?;
    }
    Ok(())
}
