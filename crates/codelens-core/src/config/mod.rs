mod env;
mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use std::path::{Path, PathBuf};
use std::time::Duration;

use codelens_index::{ChunkerConfig, PipelineConfig, RetrievalConfig};

use crate::chat::{ChatSettings, TRUNCATION_MARKER};
use crate::error::ConfigError;

/// Config file used when neither `--config` nor `CODELENS_CONFIG` is set.
pub const DEFAULT_CONFIG_PATH: &str = "codelens.toml";

impl Config {
    /// Pick the config file: explicit path, then `CODELENS_CONFIG`, then
    /// [`DEFAULT_CONFIG_PATH`].
    #[must_use]
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        std::env::var("CODELENS_CONFIG")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
    }

    /// Load configuration from a TOML file, apply env var overrides and
    /// validate the result.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or if
    /// the final configuration does not validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str::<Self>(&content)?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));

        if self.llm.base_url.trim().is_empty() {
            return invalid("llm.base_url must not be empty");
        }
        if self.llm.model.trim().is_empty() {
            return invalid("llm.model must not be empty");
        }
        if self.llm.max_tokens == 0 {
            return invalid("llm.max_tokens must be greater than zero");
        }
        if self.storage.sqlite_path.trim().is_empty() {
            return invalid("storage.sqlite_path must not be empty");
        }
        self.pipeline_config()?.validate()?;
        if self.retrieval.candidate_multiplier == 0 {
            return invalid("retrieval.candidate_multiplier must be greater than zero");
        }
        if !(1..=codelens_index::retriever::MAX_LIMIT).contains(&self.chat.context_chunks) {
            return invalid("chat.context_chunks must be between 1 and 100");
        }
        if !(0.0..=1.0).contains(&self.chat.vector_weight) {
            return invalid("chat.vector_weight must be within [0, 1]");
        }
        if self.chat.max_prompt_length <= TRUNCATION_MARKER.chars().count() {
            return Err(ConfigError::Invalid(format!(
                "chat.max_prompt_length must be greater than {}",
                TRUNCATION_MARKER.chars().count()
            )));
        }
        if self.timeouts.vector_seconds == 0
            || self.timeouts.embedding_seconds == 0
            || self.timeouts.completion_seconds == 0
        {
            return invalid("timeouts must be greater than zero");
        }
        if self.status.ttl_seconds == 0 || self.status.eviction_interval_seconds == 0 {
            return invalid("status.ttl_seconds and status.eviction_interval_seconds must be greater than zero");
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the chunk window is inconsistent.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        Ok(PipelineConfig {
            collection: self.vector.collection.clone(),
            chunker: ChunkerConfig::new(self.chunking.chunk_size, self.chunking.overlap_size)?,
            batch_size: self.embedding.batch_size,
            workers: self.embedding.workers,
            queue_capacity: self.embedding.queue_capacity,
            overflow_policy: self.embedding.overflow_policy,
            failure_tolerance: self.embedding.failure_tolerance,
            embedding_timeout: self.timeouts.embedding(),
        })
    }

    #[must_use]
    pub fn retrieval_config(&self) -> RetrievalConfig {
        RetrievalConfig {
            collection: self.vector.collection.clone(),
            candidate_multiplier: self.retrieval.candidate_multiplier,
            embedding_timeout: self.timeouts.embedding(),
        }
    }

    #[must_use]
    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            context_chunks: self.chat.context_chunks,
            vector_weight: self.chat.vector_weight,
            max_prompt_length: self.chat.max_prompt_length,
            completion_timeout: self.timeouts.completion(),
        }
    }

    #[must_use]
    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status.ttl_seconds)
    }

    #[must_use]
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.status.eviction_interval_seconds)
    }
}
