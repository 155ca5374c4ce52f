pub mod env;
pub mod invocation;
pub mod model_map;
pub mod output_parse;
pub mod runner;
pub mod supervisor;

pub use env::filtered_env;
pub use invocation::{build_invocation, InvocationSpec};
pub use model_map::resolve_model;
pub use output_parse::{parse_executor_output, ParsedOutput};
pub use runner::{run_command, CancelHandle, RunOutput};
pub use supervisor::TaskSupervisor;

/// How much failure detail reaches the outbound callback.
pub const ERROR_DETAIL_MAX_CHARS: usize = 300;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("executor binary not found: {binary}")]
    MissingBinary { binary: String },
    #[error("executor exited with code {exit_code}: {detail}")]
    NonZeroExit {
        exit_code: i32,
        detail: String,
        /// A resume against a stale session token, retriable once.
        stale_session: bool,
    },
    #[error("task timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
    #[error("task stopped by user")]
    Stopped,
    #[error("sandbox failure: {0}")]
    Sandbox(#[from] crate::sandbox::SandboxError),
    #[error("executor io error: {source}")]
    Io {
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn truncate_detail(detail: &str) -> String {
    let trimmed = detail.trim();
    if trimmed.chars().count() <= ERROR_DETAIL_MAX_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(ERROR_DETAIL_MAX_CHARS).collect();
    out.push('…');
    out
}
