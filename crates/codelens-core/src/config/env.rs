use std::str::FromStr;

use super::{Config, Secret};

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    if let Ok(value) = raw.trim().parse::<T>() {
        Some(value)
    } else {
        tracing::warn!("ignoring invalid {key} value: {raw}");
        None
    }
}

/// Parse through the type's serde representation, as written in TOML.
fn env_serde<T: serde::de::DeserializeOwned>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    if let Ok(value) = serde_json::from_value(serde_json::Value::String(raw.trim().to_lowercase()))
    {
        Some(value)
    } else {
        tracing::warn!("ignoring invalid {key} value: {raw}");
        None
    }
}

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_llm();
        self.apply_env_overrides_storage();
        self.apply_env_overrides_indexing();
        self.apply_env_overrides_runtime();
    }

    fn apply_env_overrides_llm(&mut self) {
        if let Some(kind) = env_serde("CODELENS_LLM_PROVIDER") {
            self.llm.provider = kind;
        }
        if let Some(v) = env_string("CODELENS_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = env_string("CODELENS_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = env_string("CODELENS_LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = v;
        }
        if let Some(n) = env_parsed("CODELENS_LLM_MAX_TOKENS") {
            self.llm.max_tokens = n;
        }
        if let Some(n) = env_parsed("CODELENS_LLM_MAX_RETRIES") {
            self.llm.max_retries = n;
        }
        if let Some(v) = env_string("CODELENS_LLM_API_KEY") {
            self.llm.api_key = Some(Secret::new(v));
        }
    }

    fn apply_env_overrides_storage(&mut self) {
        if let Some(v) = env_string("CODELENS_SQLITE_PATH") {
            self.storage.sqlite_path = v;
        }
        if let Some(v) = env_string("CODELENS_QDRANT_URL") {
            self.vector.qdrant_url = v;
        }
        if let Some(v) = env_string("CODELENS_VECTOR_COLLECTION") {
            self.vector.collection = v;
        }
    }

    fn apply_env_overrides_indexing(&mut self) {
        if let Some(n) = env_parsed("CODELENS_CHUNK_SIZE") {
            self.chunking.chunk_size = n;
        }
        if let Some(n) = env_parsed("CODELENS_CHUNK_OVERLAP") {
            self.chunking.overlap_size = n;
        }
        if let Some(n) = env_parsed("CODELENS_EMBEDDING_BATCH_SIZE") {
            self.embedding.batch_size = n;
        }
        if let Some(n) = env_parsed("CODELENS_EMBEDDING_WORKERS") {
            self.embedding.workers = n;
        }
        if let Some(n) = env_parsed("CODELENS_EMBEDDING_QUEUE_CAPACITY") {
            self.embedding.queue_capacity = n;
        }
        if let Some(policy) = env_serde("CODELENS_EMBEDDING_OVERFLOW_POLICY") {
            self.embedding.overflow_policy = policy;
        }
        if let Some(ratio) = env_parsed("CODELENS_EMBEDDING_FAILURE_TOLERANCE") {
            self.embedding.failure_tolerance = ratio;
        }
        if let Some(n) = env_parsed("CODELENS_RETRIEVAL_CANDIDATE_MULTIPLIER") {
            self.retrieval.candidate_multiplier = n;
        }
    }

    fn apply_env_overrides_runtime(&mut self) {
        if let Some(n) = env_parsed("CODELENS_CHAT_CONTEXT_CHUNKS") {
            self.chat.context_chunks = n;
        }
        if let Some(w) = env_parsed("CODELENS_CHAT_VECTOR_WEIGHT") {
            self.chat.vector_weight = w;
        }
        if let Some(n) = env_parsed("CODELENS_CHAT_MAX_PROMPT_LENGTH") {
            self.chat.max_prompt_length = n;
        }
        if let Some(secs) = env_parsed("CODELENS_TIMEOUT_VECTOR") {
            self.timeouts.vector_seconds = secs;
        }
        if let Some(secs) = env_parsed("CODELENS_TIMEOUT_EMBEDDING") {
            self.timeouts.embedding_seconds = secs;
        }
        if let Some(secs) = env_parsed("CODELENS_TIMEOUT_COMPLETION") {
            self.timeouts.completion_seconds = secs;
        }
        if let Some(secs) = env_parsed("CODELENS_STATUS_TTL") {
            self.status.ttl_seconds = secs;
        }
        if let Some(secs) = env_parsed("CODELENS_STATUS_EVICTION_INTERVAL") {
            self.status.eviction_interval_seconds = secs;
        }
    }
}
