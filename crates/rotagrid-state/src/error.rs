//! Error types for the rotagrid state layer.

use thiserror::Error;

/// Result type alias for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while reading or replicating shared state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("shared state actor has shut down")]
    Closed,

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}
