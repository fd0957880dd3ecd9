//! Error types for workq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("backend error: {0}")]
    Backend(#[from] sqlx::Error),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for failures of the shared store itself, as opposed to
    /// data-level problems the queue heals on its own.
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
