use std::io::Write;

use codelens_index::OverflowPolicy;
use serial_test::serial;

use super::*;

const ENV_KEYS: [&str; 27] = [
    "CODELENS_CONFIG",
    "CODELENS_LLM_PROVIDER",
    "CODELENS_LLM_BASE_URL",
    "CODELENS_LLM_MODEL",
    "CODELENS_LLM_EMBEDDING_MODEL",
    "CODELENS_LLM_MAX_TOKENS",
    "CODELENS_LLM_MAX_RETRIES",
    "CODELENS_LLM_API_KEY",
    "CODELENS_SQLITE_PATH",
    "CODELENS_QDRANT_URL",
    "CODELENS_VECTOR_COLLECTION",
    "CODELENS_CHUNK_SIZE",
    "CODELENS_CHUNK_OVERLAP",
    "CODELENS_EMBEDDING_BATCH_SIZE",
    "CODELENS_EMBEDDING_WORKERS",
    "CODELENS_EMBEDDING_QUEUE_CAPACITY",
    "CODELENS_EMBEDDING_OVERFLOW_POLICY",
    "CODELENS_EMBEDDING_FAILURE_TOLERANCE",
    "CODELENS_RETRIEVAL_CANDIDATE_MULTIPLIER",
    "CODELENS_CHAT_CONTEXT_CHUNKS",
    "CODELENS_CHAT_VECTOR_WEIGHT",
    "CODELENS_CHAT_MAX_PROMPT_LENGTH",
    "CODELENS_TIMEOUT_VECTOR",
    "CODELENS_TIMEOUT_EMBEDDING",
    "CODELENS_TIMEOUT_COMPLETION",
    "CODELENS_STATUS_TTL",
    "CODELENS_STATUS_EVICTION_INTERVAL",
];

fn clear_env() {
    for key in ENV_KEYS {
        unsafe { std::env::remove_var(key) };
    }
}

fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("codelens.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    write!(f, "{body}").unwrap();
    path
}

#[test]
fn defaults() {
    let config = Config::default();
    assert_eq!(config.llm.provider, ProviderKind::OpenAi);
    assert_eq!(config.chunking.chunk_size, 30);
    assert_eq!(config.chunking.overlap_size, 10);
    assert_eq!(config.embedding.batch_size, 50);
    assert_eq!(config.embedding.workers, 3);
    assert_eq!(config.embedding.queue_capacity, 100);
    assert_eq!(config.embedding.overflow_policy, OverflowPolicy::Fallback);
    assert!((config.embedding.failure_tolerance - 0.25).abs() < f64::EPSILON);
    assert_eq!(config.retrieval.candidate_multiplier, 3);
    assert_eq!(config.chat.context_chunks, 8);
    assert_eq!(config.chat.max_prompt_length, 12_000);
    assert_eq!(config.timeouts.vector_seconds, 10);
    assert_eq!(config.timeouts.embedding_seconds, 30);
    assert_eq!(config.timeouts.completion_seconds, 120);
    assert_eq!(config.status.ttl_seconds, 3600);
    assert!(config.llm.api_key.is_none());
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn missing_file_falls_back_to_defaults() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.vector.collection, "code_chunks");
}

#[test]
#[serial]
fn parse_partial_toml() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"
[llm]
model = "local-model"
base_url = "http://localhost:8080/v1"

[chunking]
chunk_size = 40
overlap_size = 5

[embedding]
overflow_policy = "reject"
workers = 2

[chat]
vector_weight = 0.5
"#,
    );

    let config = Config::load(&path).unwrap();
    assert_eq!(config.llm.model, "local-model");
    assert_eq!(config.llm.embedding_model, "text-embedding-3-small");
    assert_eq!(config.chunking.chunk_size, 40);
    assert_eq!(config.embedding.overflow_policy, OverflowPolicy::Reject);
    assert_eq!(config.embedding.workers, 2);
    assert_eq!(config.embedding.batch_size, 50);
    assert!((config.chat.vector_weight - 0.5).abs() < f32::EPSILON);

    let pipeline = config.pipeline_config().unwrap();
    assert_eq!(pipeline.chunker.stride(), 35);
}

#[test]
#[serial]
fn malformed_toml_is_a_parse_error() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "[chunking\nchunk_size = ");
    assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
}

#[test]
#[serial]
fn overlap_not_below_chunk_size_is_rejected() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "[chunking]\nchunk_size = 10\noverlap_size = 10\n");
    let err = Config::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
}

#[test]
#[serial]
fn env_overrides() {
    clear_env();
    let mut config = Config::default();

    unsafe {
        std::env::set_var("CODELENS_LLM_MODEL", "gpt-test");
        std::env::set_var("CODELENS_LLM_PROVIDER", "mock");
        std::env::set_var("CODELENS_EMBEDDING_WORKERS", "7");
        std::env::set_var("CODELENS_EMBEDDING_OVERFLOW_POLICY", "Reject");
        std::env::set_var("CODELENS_CHAT_VECTOR_WEIGHT", "0.25");
        std::env::set_var("CODELENS_LLM_API_KEY", "sk-test");
    }
    config.apply_env_overrides();
    clear_env();

    assert_eq!(config.llm.model, "gpt-test");
    assert_eq!(config.llm.provider, ProviderKind::Mock);
    assert_eq!(config.embedding.workers, 7);
    assert_eq!(config.embedding.overflow_policy, OverflowPolicy::Reject);
    assert!((config.chat.vector_weight - 0.25).abs() < f32::EPSILON);
    assert_eq!(config.llm.api_key.as_ref().map(Secret::expose), Some("sk-test"));
}

#[test]
#[serial]
fn invalid_env_values_are_ignored() {
    clear_env();
    let mut config = Config::default();

    unsafe {
        std::env::set_var("CODELENS_EMBEDDING_WORKERS", "many");
        std::env::set_var("CODELENS_EMBEDDING_OVERFLOW_POLICY", "drop");
        std::env::set_var("CODELENS_LLM_PROVIDER", "unknown");
        std::env::set_var("CODELENS_TIMEOUT_COMPLETION", "-5");
    }
    config.apply_env_overrides();
    clear_env();

    assert_eq!(config.embedding.workers, 3);
    assert_eq!(config.embedding.overflow_policy, OverflowPolicy::Fallback);
    assert_eq!(config.llm.provider, ProviderKind::OpenAi);
    assert_eq!(config.timeouts.completion_seconds, 120);
}

#[test]
#[serial]
fn env_override_can_invalidate_config() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    unsafe { std::env::set_var("CODELENS_CHAT_VECTOR_WEIGHT", "1.5") };
    let result = Config::load(&dir.path().join("absent.toml"));
    clear_env();
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
#[serial]
fn resolve_path_precedence() {
    clear_env();
    assert_eq!(
        Config::resolve_path(None),
        PathBuf::from(DEFAULT_CONFIG_PATH)
    );

    unsafe { std::env::set_var("CODELENS_CONFIG", "/etc/codelens.toml") };
    assert_eq!(
        Config::resolve_path(None),
        PathBuf::from("/etc/codelens.toml")
    );
    assert_eq!(
        Config::resolve_path(Some(Path::new("local.toml"))),
        PathBuf::from("local.toml")
    );
    clear_env();
}

#[test]
fn validation_rejects_out_of_range_values() {
    let mut config = Config::default();
    config.chat.context_chunks = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.embedding.failure_tolerance = 2.0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.timeouts.embedding_seconds = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.retrieval.candidate_multiplier = 0;
    assert!(config.validate().is_err());
}

#[test]
fn prompt_length_must_leave_room_for_the_marker() {
    let marker_len = crate::chat::TRUNCATION_MARKER.chars().count();
    let mut config = Config::default();

    config.chat.max_prompt_length = 1;
    assert!(config.validate().is_err());
    config.chat.max_prompt_length = marker_len;
    assert!(config.validate().is_err());
    config.chat.max_prompt_length = marker_len + 1;
    assert!(config.validate().is_ok());
}

#[test]
fn secret_is_redacted_in_debug() {
    let mut config = Config::default();
    config.llm.api_key = Some(Secret::new("sk-live-123"));
    let debug = format!("{config:?}");
    assert!(!debug.contains("sk-live-123"));
    assert!(debug.contains("[REDACTED]"));
}

#[test]
fn derived_settings_follow_config() {
    let config = Config::default();
    let retrieval = config.retrieval_config();
    assert_eq!(retrieval.collection, "code_chunks");
    assert_eq!(retrieval.candidate_multiplier, 3);
    let chat = config.chat_settings();
    assert_eq!(chat.context_chunks, 8);
    assert_eq!(chat.completion_timeout, Duration::from_secs(120));
}
