use std::path::PathBuf;

use codelens_index::IndexError;
use codelens_llm::LlmError;
use codelens_store::StoreError;

/// Configuration errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<IndexError> for ConfigError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::InvalidConfig(msg) => Self::Invalid(msg),
            other => Self::Invalid(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat session not found: {0}")]
    SessionNotFound(String),

    #[error("message must not be empty")]
    EmptyMessage,

    /// Context retrieval failed; the wrapped error says whether a retry helps.
    #[error("retrieval failed: {0}")]
    Retrieval(#[from] IndexError),

    #[error("completion provider unavailable: {0}")]
    Completion(#[source] LlmError),

    #[error("completion timed out after {seconds}s")]
    CompletionTimeout { seconds: u64 },

    #[error("chat store error: {0}")]
    Store(#[from] StoreError),
}

impl ChatError {
    /// Whether the same request may succeed later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Retrieval(e) => e.is_retryable(),
            Self::Completion(_) | Self::CompletionTimeout { .. } => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::SessionNotFound(_) => true,
            Self::Retrieval(e) => e.is_not_found(),
            Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}
