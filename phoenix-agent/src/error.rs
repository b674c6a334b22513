//! Agent-local error type. Unlike `PhoenixError` this never crosses an
//! HTTP boundary — it only needs to carry enough to log and decide
//! retry vs. give up.

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    #[error("control plane unreachable: {0}")]
    Network(String),

    #[error("control plane returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to spawn or manage collector process: {0}")]
    Process(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
