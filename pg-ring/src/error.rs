use thiserror::Error;

/// Infrastructure failures of ring operations.
///
/// Absence, throttling and empty rings are ordinary results
/// ([`Outcome`](crate::Outcome), [`Advance`](crate::Advance)) and never
/// show up here.
#[derive(Error, Debug)]
pub enum Error {
    /// The store could not be reached or rejected the statement.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The caller's cancellation token fired before the operation committed.
    #[error("Operation cancelled")]
    Cancelled,

    /// The configured operation timeout elapsed before the operation committed.
    #[error("Operation deadline exceeded")]
    DeadlineExceeded,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for failures where the operation was aborted by the caller.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}
