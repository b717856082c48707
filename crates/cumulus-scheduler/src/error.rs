//! Provisioning error types.

use thiserror::Error;

/// Errors that can occur while provisioning or waiting for resources.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("location not found: {0}")]
    LocationNotFound(String),

    #[error("storage {name} not found at {location}")]
    StorageNotFound { location: String, name: String },

    #[error("network {name} not found at {location}")]
    NetworkNotFound { location: String, name: String },

    #[error("no client locations configured")]
    NoClientLocations,

    #[error("no private address left for client {ordinal}")]
    AddressExhausted { ordinal: u32 },

    #[error("compute {name} ({id}) failed")]
    ResourceFailed { name: String, id: String },

    #[error("state store error: {0}")]
    State(#[from] cumulus_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
