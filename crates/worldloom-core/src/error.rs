//! Error types for Worldloom

use crate::types::CallStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown call: {0}")]
    UnknownCall(String),

    #[error("duplicate call: {0}")]
    DuplicateCall(String),

    #[error("cannot {operation} call {id} while it is {from}")]
    InvalidTransition {
        id: String,
        from: CallStatus,
        operation: &'static str,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("generator error: {0}")]
    Generator(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_transition(
        id: impl Into<String>,
        from: CallStatus,
        operation: &'static str,
    ) -> Self {
        Self::InvalidTransition {
            id: id.into(),
            from,
            operation,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}
