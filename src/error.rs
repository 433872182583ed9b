use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("port not found: {port_id}")]
    PortNotFound { port_id: String },

    #[error("invalid port spec: {spec:?}")]
    InvalidSpec { spec: String },

    #[error("no valid ports in requested set")]
    NoValidPorts,

    #[error("dependency graph contains a cycle (ordered {ordered} of {total})")]
    CycleDetected { total: usize, ordered: usize },

    #[error("database error: {0}")]
    DatabaseError(#[source] sled::Error),

    #[error("build record error: {0}")]
    RecordError(String),

    #[error("crc index error: {0}")]
    CRCError(String),

    #[error("package index error: {0}")]
    PackageIndexError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("environment setup failed ({failed_mounts} mount(s) failed)")]
    SetupFailed { failed_mounts: usize },

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("cleanup failed: {0}")]
    CleanupFailed(String),
}

impl From<sled::Error> for OrchestratorError {
    fn from(err: sled::Error) -> Self {
        OrchestratorError::DatabaseError(err)
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::RecordError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
