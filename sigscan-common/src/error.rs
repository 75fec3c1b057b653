//! Error types for the sigscan services.

use thiserror::Error;

/// Result type alias using the sigscan error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for sigscan services.
#[derive(Error, Debug)]
pub enum Error {
    /// Persistence error (resume slots, run history)
    #[error("Storage error: {0}")]
    Storage(String),

    /// The universe provider could not produce a ticker list
    #[error("Universe fetch failed: {0}")]
    Universe(String),

    /// Timeout error
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Cooperative cancellation was observed
    #[error("Operation cancelled")]
    Cancelled,

    /// Other error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an error with additional context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Check if this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::WithContext { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
