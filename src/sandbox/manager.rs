use super::engine::{
    BindMount, ContainerEngine, ContainerSpec, ContainerStatus, DockerEngine,
};
use super::{io_error, SandboxError};
use crate::config::SandboxSettings;
use crate::shared::{append_sandbox_log, now_secs};
use crate::state::StatePaths;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// The one workspace file `clean_workspace` never deletes.
pub const WORKSPACE_MEMORY_FILE: &str = "CLAUDE.md";
pub const DISK_WARNING_FILE: &str = "DISK_LIMIT_WARNING.txt";
const CONTAINER_WORKSPACE: &str = "/workspace";
const CONTAINER_AGENT_STATE: &str = "/root/.claude";
const CONTAINER_CREDENTIALS: &str = "/credentials";
const CONTAINER_EXECUTOR: &str = "/usr/local/bin/claude";
const CREATE_WAIT_POLL: Duration = Duration::from_millis(50);

/// Deterministic container identity for a tenant: a stable one-way hash
/// of the conversation id, truncated to stay a readable container name.
pub fn container_name(conversation_id: &str) -> String {
    let digest = Sha256::digest(conversation_id.as_bytes());
    let mut hex = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("corral-{hex}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxStatus {
    pub container: String,
    pub exists: bool,
    pub running: bool,
    pub workspace_bytes: u64,
}

/// Lifecycle owner for per-tenant sandboxed execution environments.
/// Containers are created lazily, restarted when stopped, and reaped
/// once idle past the configured threshold; the bind-mounted workspace
/// and agent-state directories outlive any container.
pub struct SandboxManager {
    engine: Arc<dyn ContainerEngine>,
    paths: StatePaths,
    settings: SandboxSettings,
    /// Tenants with a creation currently in flight; waiters poll.
    creating: Mutex<BTreeSet<String>>,
    last_used: Mutex<BTreeMap<String, i64>>,
}

impl SandboxManager {
    /// Probes the engine once; an unreachable engine disables sandboxing
    /// for the lifetime of the instance and tasks run on the host.
    pub fn detect(paths: &StatePaths, settings: &SandboxSettings) -> Option<Arc<SandboxManager>> {
        if !settings.enabled {
            return None;
        }
        let engine = Arc::new(DockerEngine::default());
        if !engine.ping() {
            append_sandbox_log(
                paths,
                "warn",
                "sandbox.disabled",
                "container engine unreachable; tasks will run on the host",
            );
            return None;
        }
        Some(Self::with_engine(engine, paths.clone(), settings.clone()))
    }

    pub fn with_engine(
        engine: Arc<dyn ContainerEngine>,
        paths: StatePaths,
        settings: SandboxSettings,
    ) -> Arc<SandboxManager> {
        Arc::new(SandboxManager {
            engine,
            paths,
            settings,
            creating: Mutex::new(BTreeSet::new()),
            last_used: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn workspace_dir(&self, conversation_id: &str) -> std::path::PathBuf {
        self.paths
            .sandbox_workspace_dir(&container_name(conversation_id))
    }

    fn touch(&self, container: &str) {
        self.last_used
            .lock()
            .expect("last_used poisoned")
            .insert(container.to_string(), now_secs());
    }

    /// Resolves the tenant's environment, creating or starting it as
    /// needed. Concurrent calls for the same tenant are serialized: one
    /// caller creates, the rest poll until the container is inspectable.
    pub fn ensure(&self, conversation_id: &str) -> Result<String, SandboxError> {
        let name = container_name(conversation_id);
        loop {
            {
                let mut creating = self.creating.lock().expect("creating set poisoned");
                if !creating.contains(&name) {
                    match self.engine.inspect(&name)?.status {
                        ContainerStatus::Running => {
                            self.touch(&name);
                            return Ok(name);
                        }
                        ContainerStatus::Stopped => {
                            self.engine.start(&name)?;
                            self.touch(&name);
                            append_sandbox_log(
                                &self.paths,
                                "info",
                                "sandbox.restarted",
                                &name,
                            );
                            return Ok(name);
                        }
                        ContainerStatus::Absent => {
                            creating.insert(name.clone());
                        }
                    }
                } else {
                    drop(creating);
                    thread::sleep(CREATE_WAIT_POLL);
                    continue;
                }
            }

            // This caller owns the creation; everyone else is polling.
            let result = self.create_container(&name);
            self.creating
                .lock()
                .expect("creating set poisoned")
                .remove(&name);
            return result.map(|_| {
                self.touch(&name);
                name
            });
        }
    }

    fn create_container(&self, name: &str) -> Result<(), SandboxError> {
        let workspace = self.paths.sandbox_workspace_dir(name);
        let agent_state = self.paths.sandbox_agent_state_dir(name);
        for dir in [&workspace, &agent_state] {
            fs::create_dir_all(dir).map_err(|err| io_error(dir, err))?;
        }

        let mut mounts = vec![
            BindMount {
                host: workspace,
                container: CONTAINER_WORKSPACE.to_string(),
                read_only: false,
            },
            BindMount {
                host: agent_state,
                container: CONTAINER_AGENT_STATE.to_string(),
                read_only: false,
            },
        ];
        if let Some(credentials) = &self.settings.credentials_dir {
            mounts.push(BindMount {
                host: credentials.clone(),
                container: CONTAINER_CREDENTIALS.to_string(),
                read_only: true,
            });
        }
        if let Some(executor) = &self.settings.executor_path {
            mounts.push(BindMount {
                host: executor.clone(),
                container: CONTAINER_EXECUTOR.to_string(),
                read_only: true,
            });
        }

        let spec = ContainerSpec {
            name: name.to_string(),
            image: self.settings.image.clone(),
            memory: self.settings.memory.clone(),
            cpus: self.settings.cpus.clone(),
            pids_limit: self.settings.pids_limit,
            storage_bytes: self.settings.storage_quota_bytes,
            mounts,
        };
        self.engine.run_detached(&spec)?;
        append_sandbox_log(&self.paths, "info", "sandbox.created", name);
        Ok(())
    }

    /// Command execing the executor inside the tenant's container; the
    /// supervisor runs it exactly like a host spawn.
    pub fn exec_command(
        &self,
        container: &str,
        argv: &[String],
        env: &BTreeMap<String, String>,
    ) -> Command {
        self.touch(container);
        self.engine
            .exec_command(container, argv, env, CONTAINER_WORKSPACE)
    }

    /// Best-effort termination of the executor inside the tenant's
    /// container. The engine's exec client does not forward signals to
    /// the exec'd process, so killing the client after a stop or
    /// timeout leaves the executor running inside; this reaps it.
    pub fn kill_executor(&self, conversation_id: &str, process_name: &str) {
        let name = container_name(conversation_id);
        let argv = vec![
            "pkill".to_string(),
            "-KILL".to_string(),
            "-f".to_string(),
            process_name.to_string(),
        ];
        let mut command =
            self.engine
                .exec_command(&name, &argv, &BTreeMap::new(), CONTAINER_WORKSPACE);
        match command.status() {
            Ok(_) => {
                append_sandbox_log(
                    &self.paths,
                    "info",
                    "sandbox.executor_killed",
                    &format!("{name} process={process_name}"),
                );
            }
            Err(err) => {
                append_sandbox_log(
                    &self.paths,
                    "warn",
                    "sandbox.executor_kill_failed",
                    &format!("{name}: {err}"),
                );
            }
        }
    }

    /// Destroys the container; workspace and agent-state dirs survive.
    pub fn remove(&self, conversation_id: &str) -> Result<(), SandboxError> {
        let name = container_name(conversation_id);
        self.engine.remove_force(&name)?;
        self.last_used
            .lock()
            .expect("last_used poisoned")
            .remove(&name);
        append_sandbox_log(&self.paths, "info", "sandbox.removed", &name);
        Ok(())
    }

    pub fn status(&self, conversation_id: &str) -> Result<SandboxStatus, SandboxError> {
        let name = container_name(conversation_id);
        let inspection = self.engine.inspect(&name)?;
        Ok(SandboxStatus {
            exists: inspection.status != ContainerStatus::Absent,
            running: inspection.status == ContainerStatus::Running,
            workspace_bytes: directory_size(&self.paths.sandbox_workspace_dir(&name)),
            container: name,
        })
    }

    /// Deletes everything in the tenant workspace except the memory
    /// file; returns the number of removed top-level entries.
    pub fn clean_workspace(&self, conversation_id: &str) -> Result<usize, SandboxError> {
        let workspace = self.paths.sandbox_workspace_dir(&container_name(conversation_id));
        if !workspace.is_dir() {
            return Ok(0);
        }

        let mut removed = 0usize;
        let entries = fs::read_dir(&workspace).map_err(|err| io_error(&workspace, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| io_error(&workspace, err))?;
            if entry.file_name().to_string_lossy() == WORKSPACE_MEMORY_FILE {
                continue;
            }
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|err| io_error(&path, err))?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Periodic sweep: any workspace above the storage quota gets a
    /// warning marker file written into it. Returns flagged containers.
    pub fn check_disk_usage(&self) -> Vec<String> {
        let mut flagged = Vec::new();
        for name in self.known_containers() {
            let workspace = self.paths.sandbox_workspace_dir(&name);
            let used = directory_size(&workspace);
            if used <= self.settings.storage_quota_bytes {
                continue;
            }
            let marker = workspace.join(DISK_WARNING_FILE);
            let body = format!(
                "Workspace is using {used} bytes; the quota is {} bytes.\n\
                 Delete files you no longer need.\n",
                self.settings.storage_quota_bytes
            );
            if fs::write(&marker, body).is_ok() {
                append_sandbox_log(
                    &self.paths,
                    "warn",
                    "sandbox.disk_quota",
                    &format!("{name} used={used}"),
                );
                flagged.push(name);
            }
        }
        flagged
    }

    /// Periodic sweep: force-destroys environments idle past the
    /// threshold. Falls back to engine-reported creation time when no
    /// activity has been recorded since startup. Returns removed names.
    pub fn reap_idle(&self) -> Vec<String> {
        let idle_cutoff = now_secs() - self.settings.idle_timeout_secs as i64;
        let mut removed = Vec::new();

        for name in self.known_containers() {
            let last_used = {
                self.last_used
                    .lock()
                    .expect("last_used poisoned")
                    .get(&name)
                    .copied()
            };
            let reference = match last_used {
                Some(ts) => Some(ts),
                None => self
                    .engine
                    .inspect(&name)
                    .ok()
                    .and_then(|inspection| inspection.created_at),
            };
            let Some(reference) = reference else {
                continue;
            };
            if reference >= idle_cutoff {
                continue;
            }
            if self.engine.remove_force(&name).is_ok() {
                self.last_used
                    .lock()
                    .expect("last_used poisoned")
                    .remove(&name);
                append_sandbox_log(
                    &self.paths,
                    "info",
                    "sandbox.reaped",
                    &format!("{name} idle since {reference}"),
                );
                removed.push(name);
            }
        }
        removed
    }

    /// Tenants this instance knows about: recorded activity plus any
    /// sandbox directory left on disk from earlier runs.
    fn known_containers(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self
            .last_used
            .lock()
            .expect("last_used poisoned")
            .keys()
            .cloned()
            .collect();
        if let Ok(entries) = fs::read_dir(self.paths.sandboxes_dir()) {
            for entry in entries.flatten() {
                let file_name = entry.file_name().to_string_lossy().to_string();
                if file_name.starts_with("corral-") && entry.path().is_dir() {
                    names.insert(file_name);
                }
            }
        }
        names
    }
}

fn directory_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0u64;
    for entry in entries.flatten() {
        let entry_path = entry.path();
        if entry_path.is_dir() {
            total += directory_size(&entry_path);
        } else if let Ok(metadata) = entry.metadata() {
            total += metadata.len();
        }
    }
    total
}
