use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{ChatMessage, ChatSession, CodeChunk, Repository, SourceFile, TextHit};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Repository, chunk and chat persistence plus the lexical text index.
pub trait DocumentStore: Send + Sync {
    fn upsert_repository(&self, repository: Repository) -> BoxFuture<'_, Result<(), StoreError>>;

    fn repository(&self, id: &str) -> BoxFuture<'_, Result<Option<Repository>, StoreError>>;

    /// Remove a repository with its files and chunks, returning the removed
    /// chunks' vector ids so the caller can clean up the vector index.
    fn delete_repository(&self, id: &str) -> BoxFuture<'_, Result<Vec<String>, StoreError>>;

    /// Replace the full file set of a repository.
    fn replace_files(
        &self,
        repository_id: &str,
        files: Vec<SourceFile>,
    ) -> BoxFuture<'_, Result<(), StoreError>>;

    fn files(&self, repository_id: &str) -> BoxFuture<'_, Result<Vec<SourceFile>, StoreError>>;

    /// All chunks of a repository ordered by file path, then start line.
    fn chunks(&self, repository_id: &str) -> BoxFuture<'_, Result<Vec<CodeChunk>, StoreError>>;

    fn chunk(&self, chunk_id: &str) -> BoxFuture<'_, Result<Option<CodeChunk>, StoreError>>;

    /// Fetch chunks by id; unknown ids are omitted.
    fn chunks_by_ids(
        &self,
        chunk_ids: Vec<String>,
    ) -> BoxFuture<'_, Result<Vec<CodeChunk>, StoreError>>;

    /// Insert or replace chunks and keep the text index in sync.
    fn upsert_chunks(&self, chunks: Vec<CodeChunk>) -> BoxFuture<'_, Result<(), StoreError>>;

    fn delete_chunks(&self, chunk_ids: Vec<String>) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Attach `(chunk_id, vector_id)` pairs and the embedding timestamp.
    fn mark_embedded(
        &self,
        updates: Vec<(String, String)>,
        embedded_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Ranked lexical search, best first. Scores are positive and unbounded.
    fn text_search(
        &self,
        repository_id: Option<&str>,
        query: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<TextHit>, StoreError>>;

    fn create_session(&self, session: ChatSession) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Load a session with its messages in insertion order.
    fn session(&self, id: &str) -> BoxFuture<'_, Result<Option<ChatSession>, StoreError>>;

    fn append_message(
        &self,
        session_id: &str,
        message: ChatMessage,
    ) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Replace content, token count and chunk refs of an existing message.
    fn update_message(
        &self,
        session_id: &str,
        message: ChatMessage,
    ) -> BoxFuture<'_, Result<(), StoreError>>;
}

/// Split a free-text query into index terms.
#[must_use]
pub fn query_terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}
