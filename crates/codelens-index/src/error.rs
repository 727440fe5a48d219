//! Error types for codelens-index.

use codelens_store::StoreError;

/// Errors raised by chunking, the embedding pipeline and retrieval.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Rejected configuration value. Fatal at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The job queue is at capacity and the overflow policy is `reject`.
    #[error("embedding queue is full ({capacity} jobs)")]
    QueueFull { capacity: usize },

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("chunk not found: {0}")]
    ChunkNotFound(String),

    /// Result limit outside `1..=max`.
    #[error("limit must be between 1 and {max}, got {value}")]
    InvalidLimit { value: usize, max: usize },

    /// Fusion weight outside `[0, 1]`.
    #[error("vector weight must be within [0, 1], got {0}")]
    InvalidWeight(f32),

    /// An upstream dependency (embedding provider, vector index, document
    /// store) failed or timed out.
    #[error("{operation} failed against {target}: {source}")]
    Unavailable {
        operation: &'static str,
        target: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Document store error outside the retrieval path.
    #[error("document store error: {0}")]
    Store(#[from] StoreError),

    /// IO error while reading a source tree.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexError {
    pub(crate) fn unavailable(
        operation: &'static str,
        target: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unavailable {
            operation,
            target: target.into(),
            source: Box::new(source),
        }
    }

    /// Whether the caller may retry the same request later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::QueueFull { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::RepositoryNotFound(_) | Self::ChunkNotFound(_) => true,
            Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
