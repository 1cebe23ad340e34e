//! Pipeline error taxonomy.
//!
//! Every I/O boundary in the ingestion and retrieval core maps its failures
//! into [`PipelineError`] so callers can make one decision: retry or give up.
//! The queue consults [`PipelineError::is_transient`] when a job fails; the
//! retriever treats every variant as a reason to degrade to zero context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed caller input (empty document text, bad chunking config).
    /// Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The embedding provider failed in a way that may succeed later
    /// (network error, rate limit, 5xx).
    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),

    /// The embedding provider rejected the request permanently
    /// (quota exhausted, invalid request). Fatal for the current job.
    #[error("embedding quota exceeded: {0}")]
    EmbeddingQuotaExceeded(String),

    /// The vector store backend could not be reached. Retryable for
    /// ingestion; retrieval degrades to no context instead.
    #[error("vector store unavailable: {0}")]
    StoreUnavailable(String),

    /// The upstream completion provider failed before or during a stream.
    #[error("completion provider error: {0}")]
    CompletionProvider(String),

    /// A referenced document does not exist. Fatal for the current job.
    #[error("document not found: {0}")]
    DocumentNotFound(String),
}

impl PipelineError {
    /// Whether the queue should retry a job that failed with this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::EmbeddingProvider(_)
                | PipelineError::StoreUnavailable(_)
                | PipelineError::CompletionProvider(_)
        )
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::StoreUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::EmbeddingProvider("429".into()).is_transient());
        assert!(PipelineError::StoreUnavailable("locked".into()).is_transient());
        assert!(!PipelineError::InvalidInput("empty".into()).is_transient());
        assert!(!PipelineError::EmbeddingQuotaExceeded("quota".into()).is_transient());
        assert!(!PipelineError::DocumentNotFound("d1".into()).is_transient());
    }

    #[test]
    fn test_sqlx_errors_map_to_store_unavailable() {
        let err: PipelineError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, PipelineError::StoreUnavailable(_)));
        assert!(err.is_transient());
    }
}
