//! Call-related error types.

use thiserror::Error;

use crate::types::CallId;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call not found: {0}")]
    NotFound(CallId),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] crate::state::InvalidTransition),

    #[error("call already exists: {0}")]
    AlreadyExists(CallId),

    #[error("max concurrent calls reached ({0})")]
    TooManyCalls(usize),

    #[error("call session closed: {0}")]
    SessionClosed(CallId),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("signaling codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
