use thiserror::Error;

pub type MbxResult<T> = Result<T, MbxError>;

#[derive(Debug, Error)]
pub enum MbxError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("network unsuitable: {0}")]
    NetworkUnsuitable(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("conflict state: {0}")]
    ConflictState(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("metadata store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MbxError {
    /// Transient failures worth another transfer attempt. Policy errors
    /// (gate, config, conflict state) and missing records are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MbxError::Transfer(_) | MbxError::Io(_))
    }
}
