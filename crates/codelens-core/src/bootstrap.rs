//! Application bootstrap: provider and store construction from [`Config`].

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use codelens_llm::any::AnyProvider;
#[cfg(feature = "mock")]
use codelens_llm::mock::MockProvider;
use codelens_llm::openai::OpenAiProvider;
use codelens_store::{QdrantOps, SqliteStore};

use crate::config::{Config, ProviderKind};
use crate::service::CodeLens;

/// # Errors
///
/// Returns an error if the API key is missing for a remote provider, the HTTP
/// client cannot be built, or the mock provider was requested without the
/// `mock` feature.
pub fn create_provider(config: &Config) -> anyhow::Result<AnyProvider> {
    match config.llm.provider {
        ProviderKind::OpenAi => {
            let api_key = config
                .llm
                .api_key
                .as_ref()
                .context("CODELENS_LLM_API_KEY is not set")?
                .expose()
                .to_owned();
            let provider = OpenAiProvider::new(
                api_key,
                config.llm.base_url.clone(),
                config.llm.model.clone(),
                config.llm.max_tokens,
                Some(config.llm.embedding_model.clone()),
            )
            .context("failed to build OpenAI provider")?
            .with_max_retries(config.llm.max_retries);
            Ok(AnyProvider::OpenAi(provider))
        }
        #[cfg(feature = "mock")]
        ProviderKind::Mock => Ok(AnyProvider::Mock(MockProvider::default())),
        #[cfg(not(feature = "mock"))]
        ProviderKind::Mock => anyhow::bail!("provider `mock` requires the `mock` feature"),
    }
}

/// Open the `SQLite` document store, creating its parent directory.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or migrations fail.
pub async fn open_document_store(config: &Config) -> anyhow::Result<SqliteStore> {
    let path = config.storage.sqlite_path.as_str();
    if path != ":memory:"
        && let Some(parent) = Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    SqliteStore::new(path)
        .await
        .with_context(|| format!("failed to open SQLite store at {path}"))
}

/// # Errors
///
/// Returns an error if the Qdrant client cannot be built.
pub fn open_vector_store(config: &Config) -> anyhow::Result<QdrantOps> {
    QdrantOps::new(&config.vector.qdrant_url, config.timeouts.vector())
        .with_context(|| format!("failed to connect to Qdrant at {}", config.vector.qdrant_url))
}

/// Build the full service from configuration.
///
/// # Errors
///
/// Returns an error if any provider or store cannot be created.
pub async fn build(config: &Config) -> anyhow::Result<CodeLens<AnyProvider>> {
    let provider = create_provider(config)?;
    let documents = open_document_store(config).await?;
    let vectors = open_vector_store(config)?;
    tracing::info!(
        provider = config.llm.provider.as_str(),
        model = %config.llm.model,
        sqlite = %config.storage.sqlite_path,
        qdrant = %config.vector.qdrant_url,
        collection = %config.vector.collection,
        "codelens configured"
    );
    Ok(CodeLens::new(
        config,
        Arc::new(documents),
        Arc::new(vectors),
        Arc::new(provider),
    )?)
}
