use super::file_lock::FileLock;
use super::model::{
    CommandOverrides, ConversationState, LocalDocument, SharedDocument, TaskRecord,
};
use super::{StateError, StatePaths};
use crate::shared::{append_core_log, atomic_write_file};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Loads the shared document without taking the lock. Readers may see a
/// pre-write snapshot; they never see a torn one (replace-on-write).
pub(crate) fn load_shared_document(paths: &StatePaths) -> SharedDocument {
    read_document(&paths.shared_document_path())
}

/// Full read-modify-write cycle over the shared document, under the
/// marker lock. Persistence failures are logged and swallowed; the
/// mutation's return value is surfaced either way.
pub(crate) fn update_shared_document<R>(
    paths: &StatePaths,
    stale_after: Duration,
    mutate: impl FnOnce(&mut SharedDocument) -> R,
) -> R {
    let lock = FileLock::acquire(&paths.shared_lock_path(), stale_after);
    if !lock.held() {
        append_core_log(
            paths,
            "warn",
            "state.lock_degraded",
            "shared document lock retries exhausted; writing unlocked",
        );
    }

    let mut document = load_shared_document(paths);
    let result = mutate(&mut document);
    persist_document(paths, &paths.shared_document_path(), &document);
    result
}

fn read_document<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => T::default(),
    }
}

fn persist_document<T: serde::Serialize>(paths: &StatePaths, path: &Path, document: &T) {
    let body = match serde_json::to_string_pretty(document) {
        Ok(body) => body,
        Err(err) => {
            append_core_log(
                paths,
                "error",
                "state.serialize_failed",
                &format!("{}: {err}", path.display()),
            );
            return;
        }
    };
    if let Err(err) = atomic_write_file(path, body.as_bytes()) {
        append_core_log(
            paths,
            "error",
            "state.persist_failed",
            &format!("{}: {err}", path.display()),
        );
    }
}

/// Dual-tier conversation store. Conversations whose identifier carries
/// the shared suffix live in the cross-instance shared document; all
/// others live in this instance's private snapshot. The in-memory table
/// stays authoritative for local conversations even when a persist fails.
pub struct SessionStore {
    paths: StatePaths,
    shared_suffix: String,
    mutex_stale: Duration,
    local: Mutex<BTreeMap<String, ConversationState>>,
}

impl SessionStore {
    pub fn open(paths: StatePaths, shared_suffix: &str, mutex_stale: Duration) -> SessionStore {
        let snapshot: LocalDocument = read_document(&paths.local_document_path());
        let store = SessionStore {
            paths,
            shared_suffix: shared_suffix.to_string(),
            mutex_stale,
            local: Mutex::new(snapshot.conversations),
        };
        store.migrate_misfiled_shared_entries();
        store
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn mutex_stale(&self) -> Duration {
        self.mutex_stale
    }

    pub fn is_shared(&self, conversation_id: &str) -> bool {
        conversation_id.contains(&self.shared_suffix)
    }

    /// Older releases kept every conversation in the local snapshot. Any
    /// shared-classified entry found there is moved into the shared
    /// document on startup, skipping conversations already present.
    fn migrate_misfiled_shared_entries(&self) {
        let misfiled: Vec<(String, ConversationState)> = {
            let local = self.local.lock().expect("local store poisoned");
            local
                .iter()
                .filter(|(id, _)| self.is_shared(id))
                .map(|(id, state)| (id.clone(), state.clone()))
                .collect()
        };
        if misfiled.is_empty() {
            return;
        }

        let migrated = update_shared_document(&self.paths, self.mutex_stale, |doc| {
            let mut moved = 0usize;
            for (id, state) in &misfiled {
                if !doc.conversations.contains_key(id) {
                    doc.conversations.insert(id.clone(), state.clone());
                    moved += 1;
                }
            }
            moved
        });

        {
            let mut local = self.local.lock().expect("local store poisoned");
            for (id, _) in &misfiled {
                local.remove(id);
            }
        }
        self.persist_local();
        append_core_log(
            &self.paths,
            "info",
            "state.migrated",
            &format!(
                "moved {migrated} shared conversations out of the local snapshot ({} already present)",
                misfiled.len() - migrated
            ),
        );
    }

    fn persist_local(&self) {
        let snapshot = {
            let local = self.local.lock().expect("local store poisoned");
            LocalDocument {
                conversations: local.clone(),
            }
        };
        persist_document(&self.paths, &self.paths.local_document_path(), &snapshot);
    }

    /// Point-in-time snapshot; absent conversations read as defaults.
    pub fn conversation(&self, conversation_id: &str) -> ConversationState {
        if self.is_shared(conversation_id) {
            load_shared_document(&self.paths)
                .conversations
                .get(conversation_id)
                .cloned()
                .unwrap_or_default()
        } else {
            self.local
                .lock()
                .expect("local store poisoned")
                .get(conversation_id)
                .cloned()
                .unwrap_or_default()
        }
    }

    pub fn update_conversation(
        &self,
        conversation_id: &str,
        mutate: impl FnOnce(&mut ConversationState),
    ) {
        if self.is_shared(conversation_id) {
            update_shared_document(&self.paths, self.mutex_stale, |doc| {
                let state = doc
                    .conversations
                    .entry(conversation_id.to_string())
                    .or_default();
                mutate(state);
                if state.is_empty() {
                    doc.conversations.remove(conversation_id);
                }
            });
        } else {
            {
                let mut local = self.local.lock().expect("local store poisoned");
                let state = local.entry(conversation_id.to_string()).or_default();
                mutate(state);
                if state.is_empty() {
                    local.remove(conversation_id);
                }
            }
            self.persist_local();
        }
    }

    pub fn session_token(&self, conversation_id: &str) -> Option<String> {
        self.conversation(conversation_id).session_token
    }

    pub fn set_session_token(&self, conversation_id: &str, token: Option<String>) {
        self.update_conversation(conversation_id, |state| {
            state.session_token = token;
        });
    }

    /// Rejected before any mutation when the directory does not exist.
    pub fn set_working_directory(
        &self,
        conversation_id: &str,
        directory: &Path,
    ) -> Result<(), StateError> {
        if !directory.is_dir() {
            return Err(StateError::WorkingDirectoryMissing {
                path: directory.display().to_string(),
            });
        }
        self.update_conversation(conversation_id, |state| {
            state.working_directory = Some(directory.to_path_buf());
        });
        Ok(())
    }

    pub fn set_model_override(&self, conversation_id: &str, model: Option<String>) {
        self.update_conversation(conversation_id, |state| {
            state.model_override = model;
        });
    }

    pub fn record_task(
        &self,
        conversation_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        record: TaskRecord,
    ) {
        self.update_conversation(conversation_id, |state| {
            state.usage.add(input_tokens, output_tokens);
            state.record_task(record);
        });
    }

    pub fn reset_conversation(&self, conversation_id: &str) {
        self.update_conversation(conversation_id, |state| state.reset());
    }

    /// Command toggles are coordination state, so they always live in the
    /// shared document regardless of conversation classification.
    pub fn set_command_override(&self, conversation_id: &str, command: &str, enabled: bool) {
        update_shared_document(&self.paths, self.mutex_stale, |doc| {
            doc.command_overrides
                .entry(conversation_id.to_string())
                .or_default()
                .set(command, enabled);
        });
    }

    pub fn command_enabled(
        &self,
        conversation_id: &str,
        command: &str,
        default_enabled: bool,
    ) -> bool {
        load_shared_document(&self.paths)
            .command_overrides
            .get(conversation_id)
            .map(|overrides| overrides.is_enabled(command, default_enabled))
            .unwrap_or(default_enabled)
    }

    pub fn command_overrides(&self, conversation_id: &str) -> CommandOverrides {
        load_shared_document(&self.paths)
            .command_overrides
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}
