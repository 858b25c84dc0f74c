//! Error types for the tender matching services.

use thiserror::Error;

/// Result type alias using the shared error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the tender matching services.
#[derive(Error, Debug)]
pub enum Error {
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Rate limit exceeded on an upstream service
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// External service error
    #[error("External service error: {0}")]
    External(String),

    /// Storage layer failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Work was interrupted by a shutdown request
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

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

    /// Check if this is a rate limit error.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::RateLimited(_) => true,
            Self::WithContext { source, .. } => source.is_rate_limited(),
            _ => false,
        }
    }

    /// Check if this error came from a shutdown request.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::WithContext { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<crate::time::Cancelled> for Error {
    fn from(_: crate::time::Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Extension trait for adding context to any error type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_with_context() {
        let err = Error::Persistence("disk full".into());
        let with_ctx = err.with_context("committing batch 2");
        assert!(matches!(with_ctx, Error::WithContext { .. }));
        assert_eq!(with_ctx.to_string(), "committing batch 2: Persistence error: disk full");
    }

    #[test]
    fn test_classification_sees_through_context() {
        let err = Error::RateLimited("429".into()).with_context("summary");
        assert!(err.is_rate_limited());
        assert!(!err.is_cancelled());

        let err = Error::Cancelled.with_context("waiting between batches");
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_result_ext_context() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        let err = res.context("reading document").unwrap_err();
        assert!(err.to_string().starts_with("reading document"));
    }
}
