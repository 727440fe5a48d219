use std::fmt;
use std::time::Duration;

use codelens_index::OverflowPolicy;
use serde::{Deserialize, Serialize};

/// Root of `codelens.toml`. Every section and field has a default.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalSettings,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

/// LLM provider backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    /// Deterministic offline provider; requires the `mock` feature.
    Mock,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Mock => "mock",
        }
    }
}

/// A string that never shows up in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Attempts after an HTTP 429 before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Only read from `CODELENS_LLM_API_KEY`.
    #[serde(skip)]
    pub api_key: Option<Secret>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            base_url: default_base_url(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            max_tokens: default_max_tokens(),
            max_retries: default_max_retries(),
            api_key: None,
        }
    }
}

fn default_sqlite_path() -> String {
    "./data/codelens.db".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

fn default_qdrant_url() -> String {
    "http://localhost:6334".into()
}

fn default_collection() -> String {
    "code_chunks".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VectorConfig {
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            qdrant_url: default_qdrant_url(),
            collection: default_collection(),
        }
    }
}

fn default_chunk_size() -> usize {
    30
}

fn default_overlap_size() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkingConfig {
    /// Lines per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Lines shared by consecutive chunks; must be below `chunk_size`.
    #[serde(default = "default_overlap_size")]
    pub overlap_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap_size: default_overlap_size(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}

fn default_workers() -> usize {
    3
}

fn default_queue_capacity() -> usize {
    100
}

fn default_failure_tolerance() -> f64 {
    0.25
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    #[serde(default = "default_failure_tolerance")]
    pub failure_tolerance: f64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            overflow_policy: OverflowPolicy::default(),
            failure_tolerance: default_failure_tolerance(),
        }
    }
}

fn default_candidate_multiplier() -> usize {
    3
}

/// The `[retrieval]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalSettings {
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

fn default_context_chunks() -> usize {
    8
}

fn default_vector_weight() -> f32 {
    0.7
}

fn default_max_prompt_length() -> usize {
    12_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatConfig {
    /// Retrieved chunks placed into each prompt.
    #[serde(default = "default_context_chunks")]
    pub context_chunks: usize,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
    /// Prompt budget in characters.
    #[serde(default = "default_max_prompt_length")]
    pub max_prompt_length: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            context_chunks: default_context_chunks(),
            vector_weight: default_vector_weight(),
            max_prompt_length: default_max_prompt_length(),
        }
    }
}

fn default_vector_timeout() -> u64 {
    10
}

fn default_embedding_timeout() -> u64 {
    30
}

fn default_completion_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_vector_timeout")]
    pub vector_seconds: u64,
    #[serde(default = "default_embedding_timeout")]
    pub embedding_seconds: u64,
    #[serde(default = "default_completion_timeout")]
    pub completion_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            vector_seconds: default_vector_timeout(),
            embedding_seconds: default_embedding_timeout(),
            completion_seconds: default_completion_timeout(),
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn vector(&self) -> Duration {
        Duration::from_secs(self.vector_seconds)
    }

    #[must_use]
    pub fn embedding(&self) -> Duration {
        Duration::from_secs(self.embedding_seconds)
    }

    #[must_use]
    pub fn completion(&self) -> Duration {
        Duration::from_secs(self.completion_seconds)
    }
}

fn default_status_ttl() -> u64 {
    3600
}

fn default_eviction_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct StatusConfig {
    /// Finished statuses are evicted this long after their last update.
    #[serde(default = "default_status_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval_seconds: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_status_ttl(),
            eviction_interval_seconds: default_eviction_interval(),
        }
    }
}
