use crate::model::Record;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InceptionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Backend call timed out after {0} ms")]
    Timeout(u64),

    #[error("Backup capture failed: {0}")]
    BackupCapture(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid: {0}")]
    Invalid(String),
}

impl InceptionError {
    /// Fatal errors stop a run; everything else is recorded against a unit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            InceptionError::Config(_) | InceptionError::ConnectionLost(_)
        )
    }
}

/// A run that stopped early, together with the records produced before it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    pub records: Vec<Record>,
    #[source]
    pub error: InceptionError,
}

impl RunFailure {
    pub fn new(error: InceptionError, records: Vec<Record>) -> Self {
        Self { records, error }
    }
}

impl From<InceptionError> for RunFailure {
    fn from(error: InceptionError) -> Self {
        Self {
            records: Vec::new(),
            error,
        }
    }
}
