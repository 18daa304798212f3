use std::path::PathBuf;
use thiserror::Error;

/// 编排核心的错误类型
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),

    #[error("{rtype} {value} not available")]
    ResourceUnavailable { rtype: String, value: String },

    #[error("no available {rtype} in range {start}-{end}")]
    RangeExhausted { rtype: String, start: u32, end: u32 },

    #[error("resource type {0} requires explicit value")]
    MissingExplicitValue(String),

    #[error("instance {0} already exists")]
    InstanceAlreadyExists(String),

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("instance {0} not running")]
    ProcessNotRunning(String),

    #[error("instance {name} is not stopped (status: {status})")]
    NotStopped { name: String, status: String },

    #[error("failed to start '{command}': {source}")]
    SpawnFailure {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("empty command")]
    EmptyCommand,

    #[error("resource type {0} no longer exists")]
    ResourceTypeGone(String),

    #[error("process {0} does not exist")]
    ProcessNotFound(i32),

    #[error("cannot read {}: {source}", path.display())]
    ProcfsUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template {0} not found")]
    TemplateNotFound(String),

    #[error("no process listening on port {0}")]
    NoListenerOnPort(u16),

    #[error("no action defined for instance {0}")]
    NoAction(String),

    #[error("failed to start action: {0}")]
    ActionFailed(#[source] std::io::Error),
}

impl OrchestratorError {
    pub fn procfs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        OrchestratorError::ProcfsUnreadable {
            path: path.into(),
            source,
        }
    }

    /// 调用方引用了不存在的对象（用于 API 层映射 404）
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            OrchestratorError::InstanceNotFound(_)
                | OrchestratorError::TemplateNotFound(_)
                | OrchestratorError::ProcessNotFound(_)
                | OrchestratorError::NoListenerOnPort(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
