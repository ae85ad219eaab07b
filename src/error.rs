//! Crate-wide error type.
//!
//! Variants split along the boundary the process records care about: the
//! first group carries operator-facing messages, the second group is
//! internal and only ever surfaces as a generic failure line.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The running operation observed its cancellation signal.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation died without reaching a terminal state on its own.
    /// Recorded on stale process records by crash recovery.
    #[error("unexpected interruption")]
    Interrupted,

    /// Transient failure reported by the external document store.
    #[error("document store error: {0}")]
    Upstream(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Message safe to record on a process for operators to read.
    /// Internal variants return None; callers log the detail and record a
    /// generic failure line instead.
    pub fn user_message(&self) -> Option<String> {
        match self {
            Error::NotFound(_)
            | Error::InvalidState(_)
            | Error::Validation(_)
            | Error::ResourceExhausted(_)
            | Error::Upstream(_) => Some(self.to_string()),
            Error::Cancelled
            | Error::Interrupted
            | Error::Db(_)
            | Error::Io(_)
            | Error::Json(_) => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
