//! Stage-level pipeline errors.
//!
//! Per-item failures never surface here; they are counted in the batch and
//! notification summaries. A `PipelineError` aborts the remaining stages of
//! the current cycle.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("persistence failure: {0}")]
    Persistence(#[source] tender_common::Error),

    #[error("source '{name}' failed: {message}")]
    Source { name: String, message: String },

    #[error("cycle cancelled by shutdown")]
    Cancelled,

    #[error("notification failure: {0}")]
    Notification(String),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<tender_common::Error> for PipelineError {
    fn from(err: tender_common::Error) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Persistence(err)
        }
    }
}

impl From<tender_common::Cancelled> for PipelineError {
    fn from(_: tender_common::Cancelled) -> Self {
        Self::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_errors_map_to_stage_errors() {
        let err: PipelineError = tender_common::Error::Persistence("locked".into()).into();
        assert!(matches!(err, PipelineError::Persistence(_)));
        assert_eq!(err.to_string(), "persistence failure: Persistence error: locked");

        let err: PipelineError = tender_common::Error::Cancelled.with_context("batch 2").into();
        assert!(err.is_cancelled());
    }
}
