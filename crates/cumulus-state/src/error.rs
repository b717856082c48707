//! Error types for the Cumulus resource repositories.

use thiserror::Error;

/// Result type alias for repository operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while talking to a resource repository.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("resource API returned {status}: {message}")]
    Api { status: u16, message: String },
}

impl StateError {
    /// Whether the error reports an absent resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_) | StateError::Api { status: 404, .. })
    }
}
