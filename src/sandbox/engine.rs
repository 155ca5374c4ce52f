use super::SandboxError;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Absent,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInspection {
    pub status: ContainerStatus,
    /// Engine-reported creation time, epoch seconds. Used as the idle
    /// fallback when no activity has been recorded yet.
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub memory: String,
    pub cpus: String,
    pub pids_limit: u32,
    /// Ephemeral (writable-layer) storage ceiling in bytes.
    pub storage_bytes: u64,
    pub mounts: Vec<BindMount>,
}

/// Narrow lifecycle surface over the container runtime. CLI-backed in
/// production; tests substitute an in-memory fake.
pub trait ContainerEngine: Send + Sync {
    /// Engine reachable at all. Checked once at startup.
    fn ping(&self) -> bool;
    fn inspect(&self, name: &str) -> Result<ContainerInspection, SandboxError>;
    fn run_detached(&self, spec: &ContainerSpec) -> Result<(), SandboxError>;
    fn start(&self, name: &str) -> Result<(), SandboxError>;
    fn remove_force(&self, name: &str) -> Result<(), SandboxError>;
    /// Prepared (not spawned) command execing inside the container.
    fn exec_command(
        &self,
        name: &str,
        argv: &[String],
        env: &BTreeMap<String, String>,
        workdir: &str,
    ) -> Command;
}

#[derive(Debug, Clone)]
pub struct DockerEngine {
    binary: String,
}

impl Default for DockerEngine {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerEngine {
    pub fn with_binary(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    fn run_engine(&self, action: &str, args: &[String]) -> Result<String, SandboxError> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| SandboxError::EngineCommand {
                action: action.to_string(),
                detail: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(SandboxError::EngineCommand {
                action: action.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn absent_detail(detail: &str) -> bool {
    let lower = detail.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

/// Another instance (or thread) won the creation race; not a failure.
fn benign_create_conflict(detail: &str) -> bool {
    let lower = detail.to_ascii_lowercase();
    lower.contains("already in use") || lower.contains("conflict")
}

fn bind_argument(mount: &BindMount) -> String {
    let mut arg = format!("{}:{}", mount.host.display(), mount.container);
    if mount.read_only {
        arg.push_str(":ro");
    }
    arg
}

fn run_arguments(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--memory".to_string(),
        spec.memory.clone(),
        "--cpus".to_string(),
        spec.cpus.clone(),
        "--pids-limit".to_string(),
        spec.pids_limit.to_string(),
        "--storage-opt".to_string(),
        format!("size={}", spec.storage_bytes),
        "--tmpfs".to_string(),
        format!("/tmp:size={}", spec.storage_bytes),
        "--security-opt".to_string(),
        "no-new-privileges".to_string(),
    ];
    for mount in &spec.mounts {
        args.push("--volume".to_string());
        args.push(bind_argument(mount));
    }
    args.push(spec.image.clone());
    // Keep the container alive between execs.
    args.push("sleep".to_string());
    args.push("infinity".to_string());
    args
}

pub(crate) fn parse_created_timestamp(raw: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.timestamp())
}

impl ContainerEngine for DockerEngine {
    fn ping(&self) -> bool {
        Command::new(&self.binary)
            .arg("version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn inspect(&self, name: &str) -> Result<ContainerInspection, SandboxError> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Running}}|{{.Created}}".to_string(),
            name.to_string(),
        ];
        match self.run_engine("inspect", &args) {
            Ok(raw) => {
                let (running, created) = raw.split_once('|').unwrap_or((raw.as_str(), ""));
                Ok(ContainerInspection {
                    status: if running.trim() == "true" {
                        ContainerStatus::Running
                    } else {
                        ContainerStatus::Stopped
                    },
                    created_at: parse_created_timestamp(created),
                })
            }
            Err(SandboxError::EngineCommand { detail, .. }) if absent_detail(&detail) => {
                Ok(ContainerInspection {
                    status: ContainerStatus::Absent,
                    created_at: None,
                })
            }
            Err(err) => Err(err),
        }
    }

    fn run_detached(&self, spec: &ContainerSpec) -> Result<(), SandboxError> {
        let args = run_arguments(spec);
        match self.run_engine("run", &args) {
            Ok(_) => Ok(()),
            Err(SandboxError::EngineCommand { detail, .. }) if benign_create_conflict(&detail) => {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn start(&self, name: &str) -> Result<(), SandboxError> {
        self.run_engine("start", &["start".to_string(), name.to_string()])
            .map(|_| ())
    }

    fn remove_force(&self, name: &str) -> Result<(), SandboxError> {
        match self.run_engine(
            "remove",
            &["rm".to_string(), "--force".to_string(), name.to_string()],
        ) {
            Ok(_) => Ok(()),
            Err(SandboxError::EngineCommand { detail, .. }) if absent_detail(&detail) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn exec_command(
        &self,
        name: &str,
        argv: &[String],
        env: &BTreeMap<String, String>,
        workdir: &str,
    ) -> Command {
        let mut command = Command::new(&self.binary);
        command.arg("exec").arg("--workdir").arg(workdir);
        for (key, value) in env {
            command.arg("--env").arg(format!("{key}={value}"));
        }
        command.arg(name);
        command.args(argv);
        command
    }
}
