mod chunks;
mod repositories;
mod sessions;

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::document_store::DocumentStore;
use crate::error::StoreError;
use crate::types::{ChatMessage, ChatSession, CodeChunk, Repository, SourceFile, TextHit};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the `SQLite` database and run migrations.
    ///
    /// Enables foreign key constraints at connection level so that
    /// `ON DELETE CASCADE` removes files and chunks with their repository.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let mut opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .foreign_keys(true);
        if path != ":memory:" {
            opts = opts
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        // An in-memory database lives and dies with its connection.
        let max_connections = if path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!(path, "sqlite store ready");

        Ok(Self { pool })
    }

    /// Expose the underlying pool for shared access by other stores.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn parse_ts(column: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData {
            column,
            message: e.to_string(),
        })
}

fn to_sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl DocumentStore for SqliteStore {
    fn upsert_repository(&self, repository: Repository) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.upsert_repository(&repository).await })
    }

    fn repository(&self, id: &str) -> BoxFuture<'_, Result<Option<Repository>, StoreError>> {
        let id = id.to_owned();
        Box::pin(async move { self.repository(&id).await })
    }

    fn delete_repository(&self, id: &str) -> BoxFuture<'_, Result<Vec<String>, StoreError>> {
        let id = id.to_owned();
        Box::pin(async move { self.delete_repository(&id).await })
    }

    fn replace_files(
        &self,
        repository_id: &str,
        files: Vec<SourceFile>,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let repository_id = repository_id.to_owned();
        Box::pin(async move { self.replace_files(&repository_id, &files).await })
    }

    fn files(&self, repository_id: &str) -> BoxFuture<'_, Result<Vec<SourceFile>, StoreError>> {
        let repository_id = repository_id.to_owned();
        Box::pin(async move { self.files(&repository_id).await })
    }

    fn chunks(&self, repository_id: &str) -> BoxFuture<'_, Result<Vec<CodeChunk>, StoreError>> {
        let repository_id = repository_id.to_owned();
        Box::pin(async move { self.chunks(&repository_id).await })
    }

    fn chunk(&self, chunk_id: &str) -> BoxFuture<'_, Result<Option<CodeChunk>, StoreError>> {
        let chunk_id = chunk_id.to_owned();
        Box::pin(async move { self.chunk(&chunk_id).await })
    }

    fn chunks_by_ids(
        &self,
        chunk_ids: Vec<String>,
    ) -> BoxFuture<'_, Result<Vec<CodeChunk>, StoreError>> {
        Box::pin(async move { self.chunks_by_ids(&chunk_ids).await })
    }

    fn upsert_chunks(&self, chunks: Vec<CodeChunk>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.upsert_chunks(&chunks).await })
    }

    fn delete_chunks(&self, chunk_ids: Vec<String>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.delete_chunks(&chunk_ids).await })
    }

    fn mark_embedded(
        &self,
        updates: Vec<(String, String)>,
        embedded_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.mark_embedded(&updates, embedded_at).await })
    }

    fn text_search(
        &self,
        repository_id: Option<&str>,
        query: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<TextHit>, StoreError>> {
        let repository_id = repository_id.map(str::to_owned);
        let query = query.to_owned();
        Box::pin(async move {
            self.text_search(repository_id.as_deref(), &query, limit)
                .await
        })
    }

    fn create_session(&self, session: ChatSession) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.create_session(&session).await })
    }

    fn session(&self, id: &str) -> BoxFuture<'_, Result<Option<ChatSession>, StoreError>> {
        let id = id.to_owned();
        Box::pin(async move { self.session(&id).await })
    }

    fn append_message(
        &self,
        session_id: &str,
        message: ChatMessage,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let session_id = session_id.to_owned();
        Box::pin(async move { self.append_message(&session_id, &message).await })
    }

    fn update_message(
        &self,
        session_id: &str,
        message: ChatMessage,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let session_id = session_id.to_owned();
        Box::pin(async move { self.update_message(&session_id, &message).await })
    }
}
