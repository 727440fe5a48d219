use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::{SqliteStore, format_ts, parse_ts, to_sql_limit};
use crate::document_store::query_terms;
use crate::error::StoreError;
use crate::types::{CodeChunk, TextHit};

const CHUNK_COLUMNS: &str = "c.id, c.repository_id, c.file_path, c.language, c.start_line, \
     c.end_line, c.content, c.content_hash, c.symbols, c.vector_id, c.embedded_at";

/// Keeps bound parameters well under `SQLite`'s variable limit.
const ID_BATCH: usize = 500;

fn chunk_from_row(row: &SqliteRow) -> Result<CodeChunk, StoreError> {
    let symbols: String = row.try_get("symbols")?;
    let embedded_at: Option<String> = row.try_get("embedded_at")?;
    Ok(CodeChunk {
        id: row.try_get("id")?,
        repository_id: row.try_get("repository_id")?,
        file_path: row.try_get("file_path")?,
        language: row.try_get("language")?,
        start_line: row.try_get("start_line")?,
        end_line: row.try_get("end_line")?,
        content: row.try_get("content")?,
        content_hash: row.try_get("content_hash")?,
        symbols: serde_json::from_str(&symbols)?,
        vector_id: row.try_get("vector_id")?,
        embedded_at: embedded_at
            .as_deref()
            .map(|raw| parse_ts("embedded_at", raw))
            .transpose()?,
    })
}

/// Build an FTS5 `MATCH` expression that ORs the quoted query terms.
fn fts_match_expression(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl SqliteStore {
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn chunks(&self, repository_id: &str) -> Result<Vec<CodeChunk>, StoreError> {
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks c WHERE c.repository_id = ? \
             ORDER BY c.file_path, c.start_line"
        );
        let rows = sqlx::query(&sql)
            .bind(repository_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    /// # Errors
    ///
    /// Returns an error if the query fails or the row cannot be decoded.
    pub async fn chunk(&self, chunk_id: &str) -> Result<Option<CodeChunk>, StoreError> {
        let sql = format!("SELECT {CHUNK_COLUMNS} FROM chunks c WHERE c.id = ?");
        let row = sqlx::query(&sql)
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(chunk_from_row).transpose()
    }

    /// # Errors
    ///
    /// Returns an error if a query fails or a row cannot be decoded.
    pub async fn chunks_by_ids(&self, chunk_ids: &[String]) -> Result<Vec<CodeChunk>, StoreError> {
        let mut out = Vec::with_capacity(chunk_ids.len());
        for batch in chunk_ids.chunks(ID_BATCH) {
            let sql = format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks c WHERE c.id IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id);
            }
            let rows = query.fetch_all(&self.pool).await?;
            for row in &rows {
                out.push(chunk_from_row(row)?);
            }
        }
        Ok(out)
    }

    /// Insert or replace chunks and their text index rows in one transaction.
    ///
    /// An existing vector id is kept when the incoming chunk has none, since
    /// equal ids imply equal content.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; nothing is written in that case.
    pub async fn upsert_chunks(&self, chunks: &[CodeChunk]) -> Result<(), StoreError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, repository_id, file_path, language, start_line, \
                    end_line, content, content_hash, symbols, vector_id, embedded_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                    repository_id = excluded.repository_id, \
                    file_path = excluded.file_path, \
                    language = excluded.language, \
                    start_line = excluded.start_line, \
                    end_line = excluded.end_line, \
                    content = excluded.content, \
                    content_hash = excluded.content_hash, \
                    symbols = excluded.symbols, \
                    vector_id = COALESCE(excluded.vector_id, chunks.vector_id), \
                    embedded_at = COALESCE(excluded.embedded_at, chunks.embedded_at)",
            )
            .bind(&chunk.id)
            .bind(&chunk.repository_id)
            .bind(&chunk.file_path)
            .bind(&chunk.language)
            .bind(chunk.start_line)
            .bind(chunk.end_line)
            .bind(&chunk.content)
            .bind(&chunk.content_hash)
            .bind(serde_json::to_string(&chunk.symbols)?)
            .bind(&chunk.vector_id)
            .bind(chunk.embedded_at.map(format_ts))
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
                .bind(&chunk.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO chunks_fts (chunk_id, repository_id, file_path, content) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.repository_id)
            .bind(&chunk.file_path)
            .bind(&chunk.content)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if any statement fails; nothing is deleted in that case.
    pub async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<(), StoreError> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for batch in chunk_ids.chunks(ID_BATCH) {
            let marks = placeholders(batch.len());
            let fts_sql = format!("DELETE FROM chunks_fts WHERE chunk_id IN ({marks})");
            let chunk_sql = format!("DELETE FROM chunks WHERE id IN ({marks})");
            let mut fts = sqlx::query(&fts_sql);
            let mut rows = sqlx::query(&chunk_sql);
            for id in batch {
                fts = fts.bind(id);
                rows = rows.bind(id);
            }
            fts.execute(&mut *tx).await?;
            rows.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if any update fails; nothing is written in that case.
    pub async fn mark_embedded(
        &self,
        updates: &[(String, String)],
        embedded_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let ts = format_ts(embedded_at);
        let mut tx = self.pool.begin().await?;
        for (chunk_id, vector_id) in updates {
            sqlx::query("UPDATE chunks SET vector_id = ?, embedded_at = ? WHERE id = ?")
                .bind(vector_id)
                .bind(&ts)
                .bind(chunk_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// BM25-ranked search over chunk content and file paths.
    ///
    /// Scores are the negated FTS5 rank, so higher is better.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn text_search(
        &self,
        repository_id: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<TextHit>, StoreError> {
        let Some(expr) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let scope = if repository_id.is_some() {
            "AND chunks_fts.repository_id = ?"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {CHUNK_COLUMNS}, chunks_fts.rank AS rank, \
                snippet(chunks_fts, 3, '<mark>', '</mark>', '...', 32) AS snippet \
             FROM chunks_fts JOIN chunks c ON c.id = chunks_fts.chunk_id \
             WHERE chunks_fts MATCH ? {scope} \
             ORDER BY chunks_fts.rank \
             LIMIT ?"
        );
        let mut q = sqlx::query(&sql).bind(expr);
        if let Some(repo) = repository_id {
            q = q.bind(repo);
        }
        let rows = q.bind(to_sql_limit(limit)).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| -> Result<TextHit, StoreError> {
                let rank: f64 = row.try_get("rank")?;
                #[allow(clippy::cast_possible_truncation)]
                let score = (-rank) as f32;
                Ok(TextHit {
                    chunk: chunk_from_row(row)?,
                    score,
                    snippet: row.try_get("snippet")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Repository;

    fn chunk(id: &str, repo: &str, path: &str, start: u32, content: &str) -> CodeChunk {
        CodeChunk {
            id: id.into(),
            repository_id: repo.into(),
            file_path: path.into(),
            language: "rust".into(),
            start_line: start,
            end_line: start + 9,
            content: content.into(),
            content_hash: format!("hash-{id}"),
            symbols: vec!["main".into()],
            vector_id: None,
            embedded_at: None,
        }
    }

    async fn seeded() -> SqliteStore {
        let s = SqliteStore::new(":memory:").await.unwrap();
        for repo in ["r1", "r2"] {
            s.upsert_repository(&Repository::new(repo, repo)).await.unwrap();
        }
        s.upsert_chunks(&[
            chunk("c1", "r1", "src/db.rs", 1, "fn open_pool() { connect database pool }"),
            chunk("c2", "r1", "src/http.rs", 1, "fn serve() { bind http listener }"),
            chunk("c3", "r2", "src/db.rs", 1, "fn migrate() { run database migrations }"),
        ])
        .await
        .unwrap();
        s
    }

    #[test]
    fn match_expression_quotes_terms() {
        assert_eq!(
            fts_match_expression("database pool?").as_deref(),
            Some("\"database\" OR \"pool\"")
        );
        assert!(fts_match_expression("  ").is_none());
    }

    #[tokio::test]
    async fn chunks_round_trip_in_order() {
        let s = seeded().await;
        let chunks = s.chunks("r1").await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].file_path, "src/db.rs");
        assert_eq!(chunks[0].symbols, vec!["main".to_owned()]);
        assert_eq!(chunks[0].end_line, 10);
    }

    #[tokio::test]
    async fn mark_embedded_sets_vector_and_survives_reupsert() {
        let s = seeded().await;
        let at = Utc::now();
        s.mark_embedded(&[("c1".into(), "c1".into())], at)
            .await
            .unwrap();
        let c = s.chunk("c1").await.unwrap().unwrap();
        assert_eq!(c.vector_id.as_deref(), Some("c1"));
        assert_eq!(c.embedded_at, Some(at));

        s.upsert_chunks(&[chunk("c1", "r1", "src/db.rs", 1, "fn open_pool() {}")])
            .await
            .unwrap();
        let c = s.chunk("c1").await.unwrap().unwrap();
        assert!(c.is_embedded());
    }

    #[tokio::test]
    async fn text_search_ranks_and_scopes() {
        let s = seeded().await;
        let hits = s.text_search(None, "database", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.score > 0.0));

        let scoped = s.text_search(Some("r1"), "database", 10).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].chunk.id, "c1");
        assert!(scoped[0].snippet.as_deref().unwrap().contains("<mark>"));
    }

    #[tokio::test]
    async fn text_search_empty_query_returns_nothing() {
        let s = seeded().await;
        assert!(s.text_search(None, "!!", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_chunks_removes_from_index() {
        let s = seeded().await;
        s.delete_chunks(&["c1".into()]).await.unwrap();
        assert!(s.chunk("c1").await.unwrap().is_none());
        let hits = s.text_search(Some("r1"), "database", 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn chunks_by_ids_skips_unknown() {
        let s = seeded().await;
        let got = s
            .chunks_by_ids(&["c3".into(), "missing".into(), "c2".into()])
            .await
            .unwrap();
        let mut ids: Vec<_> = got.into_iter().map(|c| c.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["c2", "c3"]);
    }

    #[tokio::test]
    async fn delete_repository_returns_vector_ids_and_clears_index() {
        let s = seeded().await;
        s.mark_embedded(&[("c1".into(), "c1".into())], Utc::now())
            .await
            .unwrap();
        let ids = s.delete_repository("r1").await.unwrap();
        assert_eq!(ids, vec!["c1".to_owned()]);
        assert!(s.chunks("r1").await.unwrap().is_empty());
        assert!(s.text_search(None, "http", 10).await.unwrap().is_empty());
    }
}
