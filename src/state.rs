pub mod dedup;
pub mod file_lock;
pub mod group_lock;
pub mod model;
pub mod paths;
pub mod store;

pub use dedup::{claim_message, CLAIM_RETENTION};
pub use file_lock::FileLock;
pub use group_lock::{acquire_group_lock, release_group_lock, DEFAULT_GROUP_LOCK_TTL};
pub use model::{
    ClaimEntry, CommandOverrides, ConversationState, GroupLockEntry, LocalDocument, SharedDocument,
    TaskRecord, TaskStatus, TokenUsage,
};
pub use paths::{
    bootstrap_state_root, default_state_root_path, StatePaths, DEFAULT_STATE_ROOT_DIR,
};
pub use store::SessionStore;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to create state path {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to resolve home directory for the state root")]
    HomeDirectoryUnavailable,
    #[error("working directory does not exist: {path}")]
    WorkingDirectoryMissing { path: String },
}
