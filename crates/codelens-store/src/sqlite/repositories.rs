use sqlx::Row;

use super::{SqliteStore, format_ts, parse_ts};
use crate::error::StoreError;
use crate::types::{Repository, SourceFile};

impl SqliteStore {
    /// Insert a repository or update its name and root path.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn upsert_repository(&self, repository: &Repository) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO repositories (id, name, root_path, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                name = excluded.name, \
                root_path = excluded.root_path, \
                updated_at = excluded.updated_at",
        )
        .bind(&repository.id)
        .bind(&repository.name)
        .bind(&repository.root_path)
        .bind(format_ts(repository.created_at))
        .bind(format_ts(repository.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the query fails or a stored timestamp is malformed.
    pub async fn repository(&self, id: &str) -> Result<Option<Repository>, StoreError> {
        let row: Option<(String, String, Option<String>, String, String)> = sqlx::query_as(
            "SELECT id, name, root_path, created_at, updated_at FROM repositories WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(
            |(id, name, root_path, created_at, updated_at)| -> Result<Repository, StoreError> {
                Ok(Repository {
                    id,
                    name,
                    root_path,
                    created_at: parse_ts("created_at", &created_at)?,
                    updated_at: parse_ts("updated_at", &updated_at)?,
                })
            },
        )
        .transpose()
    }

    /// Delete a repository, its files and chunks. Returns the vector ids that
    /// were attached to the removed chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; nothing is deleted in that case.
    pub async fn delete_repository(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let vector_ids: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT vector_id FROM chunks \
             WHERE repository_id = ? AND vector_id IS NOT NULL",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chunks_fts WHERE repository_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM repositories WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(vector_ids)
    }

    /// Replace every file of a repository in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the repository does not exist.
    pub async fn replace_files(
        &self,
        repository_id: &str,
        files: &[SourceFile],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM repositories WHERE id = ?")
            .bind(repository_id)
            .fetch_one(&mut *tx)
            .await?;
        if !exists {
            return Err(StoreError::not_found("repository", repository_id));
        }
        sqlx::query("DELETE FROM source_files WHERE repository_id = ?")
            .bind(repository_id)
            .execute(&mut *tx)
            .await?;
        for file in files {
            sqlx::query(
                "INSERT INTO source_files (repository_id, path, language, content) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(repository_id)
            .bind(&file.path)
            .bind(&file.language)
            .bind(&file.content)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn files(&self, repository_id: &str) -> Result<Vec<SourceFile>, StoreError> {
        let rows = sqlx::query(
            "SELECT repository_id, path, language, content FROM source_files \
             WHERE repository_id = ? ORDER BY path",
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<SourceFile, StoreError> {
                Ok(SourceFile {
                    repository_id: row.try_get("repository_id")?,
                    path: row.try_get("path")?,
                    language: row.try_get("language")?,
                    content: row.try_get("content")?,
                })
            })
            .collect()
    }
}
