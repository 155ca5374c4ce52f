pub mod engine;
pub mod manager;

pub use engine::{
    BindMount, ContainerEngine, ContainerInspection, ContainerSpec, ContainerStatus, DockerEngine,
};
pub use manager::{container_name, SandboxManager, SandboxStatus, WORKSPACE_MEMORY_FILE};

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("container engine {action} failed: {detail}")]
    EngineCommand { action: String, detail: String },
    #[error("sandbox io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn io_error(path: &std::path::Path, source: std::io::Error) -> SandboxError {
    SandboxError::Io {
        path: path.display().to_string(),
        source,
    }
}
