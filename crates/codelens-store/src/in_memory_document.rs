use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::document_store::{DocumentStore, query_terms};
use crate::error::StoreError;
use crate::types::{ChatMessage, ChatSession, CodeChunk, Repository, SourceFile, TextHit};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Default)]
struct Inner {
    repositories: HashMap<String, Repository>,
    files: HashMap<String, Vec<SourceFile>>,
    chunks: BTreeMap<String, CodeChunk>,
    sessions: HashMap<String, ChatSession>,
}

/// Process-local [`DocumentStore`] with term-frequency text scoring.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    inner: RwLock<Inner>,
}

impl InMemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let guard = self
            .inner
            .read()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        f(&guard)
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut Inner) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self
            .inner
            .write()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        f(&mut guard)
    }
}

impl std::fmt::Debug for InMemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDocumentStore")
            .finish_non_exhaustive()
    }
}

/// Sum of term occurrences in the lowercased content and path.
#[allow(clippy::cast_precision_loss)]
fn term_score(chunk: &CodeChunk, terms: &[String]) -> f32 {
    let haystack = format!("{} {}", chunk.file_path, chunk.content).to_lowercase();
    terms
        .iter()
        .map(|t| haystack.matches(t.as_str()).count() as f32)
        .sum()
}

fn snippet(content: &str, terms: &[String]) -> Option<String> {
    let line = content.lines().find(|line| {
        let lower = line.to_lowercase();
        terms.iter().any(|t| lower.contains(t.as_str()))
    })?;
    let mut out = line.trim().to_owned();
    for t in terms {
        if let Some(pos) = out.to_lowercase().find(t.as_str())
            && out.is_char_boundary(pos)
            && out.is_char_boundary(pos + t.len())
        {
            out.insert_str(pos + t.len(), "</mark>");
            out.insert_str(pos, "<mark>");
            break;
        }
    }
    Some(out)
}

fn sorted_chunks<'a>(chunks: impl Iterator<Item = &'a CodeChunk>) -> Vec<CodeChunk> {
    let mut out: Vec<CodeChunk> = chunks.cloned().collect();
    out.sort_by(|a, b| {
        a.file_path
            .cmp(&b.file_path)
            .then(a.start_line.cmp(&b.start_line))
    });
    out
}

impl DocumentStore for InMemoryDocumentStore {
    fn upsert_repository(&self, repository: Repository) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.write(|inner| {
                match inner.repositories.get_mut(&repository.id) {
                    Some(existing) => {
                        existing.name = repository.name;
                        existing.root_path = repository.root_path;
                        existing.updated_at = repository.updated_at;
                    }
                    None => {
                        inner
                            .repositories
                            .insert(repository.id.clone(), repository);
                    }
                }
                Ok(())
            })
        })
    }

    fn repository(&self, id: &str) -> BoxFuture<'_, Result<Option<Repository>, StoreError>> {
        let id = id.to_owned();
        Box::pin(async move { self.read(|inner| Ok(inner.repositories.get(&id).cloned())) })
    }

    fn delete_repository(&self, id: &str) -> BoxFuture<'_, Result<Vec<String>, StoreError>> {
        let id = id.to_owned();
        Box::pin(async move {
            self.write(|inner| {
                inner.repositories.remove(&id);
                inner.files.remove(&id);
                let mut vector_ids = Vec::new();
                inner.chunks.retain(|_, c| {
                    if c.repository_id != id {
                        return true;
                    }
                    if let Some(v) = &c.vector_id {
                        vector_ids.push(v.clone());
                    }
                    false
                });
                vector_ids.sort();
                vector_ids.dedup();
                Ok(vector_ids)
            })
        })
    }

    fn replace_files(
        &self,
        repository_id: &str,
        files: Vec<SourceFile>,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let repository_id = repository_id.to_owned();
        Box::pin(async move {
            self.write(|inner| {
                if !inner.repositories.contains_key(&repository_id) {
                    return Err(StoreError::not_found("repository", repository_id));
                }
                inner.files.insert(repository_id, files);
                Ok(())
            })
        })
    }

    fn files(&self, repository_id: &str) -> BoxFuture<'_, Result<Vec<SourceFile>, StoreError>> {
        let repository_id = repository_id.to_owned();
        Box::pin(async move {
            self.read(|inner| {
                let mut files = inner.files.get(&repository_id).cloned().unwrap_or_default();
                files.sort_by(|a, b| a.path.cmp(&b.path));
                Ok(files)
            })
        })
    }

    fn chunks(&self, repository_id: &str) -> BoxFuture<'_, Result<Vec<CodeChunk>, StoreError>> {
        let repository_id = repository_id.to_owned();
        Box::pin(async move {
            self.read(|inner| {
                Ok(sorted_chunks(
                    inner
                        .chunks
                        .values()
                        .filter(|c| c.repository_id == repository_id),
                ))
            })
        })
    }

    fn chunk(&self, chunk_id: &str) -> BoxFuture<'_, Result<Option<CodeChunk>, StoreError>> {
        let chunk_id = chunk_id.to_owned();
        Box::pin(async move { self.read(|inner| Ok(inner.chunks.get(&chunk_id).cloned())) })
    }

    fn chunks_by_ids(
        &self,
        chunk_ids: Vec<String>,
    ) -> BoxFuture<'_, Result<Vec<CodeChunk>, StoreError>> {
        Box::pin(async move {
            self.read(|inner| {
                Ok(chunk_ids
                    .iter()
                    .filter_map(|id| inner.chunks.get(id).cloned())
                    .collect())
            })
        })
    }

    fn upsert_chunks(&self, chunks: Vec<CodeChunk>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.write(|inner| {
                for mut chunk in chunks {
                    if chunk.vector_id.is_none()
                        && let Some(existing) = inner.chunks.get(&chunk.id)
                    {
                        chunk.vector_id.clone_from(&existing.vector_id);
                        chunk.embedded_at = existing.embedded_at;
                    }
                    inner.chunks.insert(chunk.id.clone(), chunk);
                }
                Ok(())
            })
        })
    }

    fn delete_chunks(&self, chunk_ids: Vec<String>) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.write(|inner| {
                for id in &chunk_ids {
                    inner.chunks.remove(id);
                }
                Ok(())
            })
        })
    }

    fn mark_embedded(
        &self,
        updates: Vec<(String, String)>,
        embedded_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.write(|inner| {
                for (chunk_id, vector_id) in updates {
                    if let Some(chunk) = inner.chunks.get_mut(&chunk_id) {
                        chunk.vector_id = Some(vector_id);
                        chunk.embedded_at = Some(embedded_at);
                    }
                }
                Ok(())
            })
        })
    }

    fn text_search(
        &self,
        repository_id: Option<&str>,
        query: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<TextHit>, StoreError>> {
        let repository_id = repository_id.map(str::to_owned);
        let terms = query_terms(query);
        Box::pin(async move {
            if terms.is_empty() || limit == 0 {
                return Ok(Vec::new());
            }
            self.read(|inner| {
                let mut hits: Vec<TextHit> = inner
                    .chunks
                    .values()
                    .filter(|c| {
                        repository_id
                            .as_deref()
                            .is_none_or(|repo| c.repository_id == repo)
                    })
                    .filter_map(|c| {
                        let score = term_score(c, &terms);
                        (score > 0.0).then(|| TextHit {
                            snippet: snippet(&c.content, &terms),
                            chunk: c.clone(),
                            score,
                        })
                    })
                    .collect();
                hits.sort_by(|a, b| {
                    b.score
                        .total_cmp(&a.score)
                        .then_with(|| a.chunk.id.cmp(&b.chunk.id))
                });
                hits.truncate(limit);
                Ok(hits)
            })
        })
    }

    fn create_session(&self, session: ChatSession) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.write(|inner| {
                if inner.sessions.contains_key(&session.id) {
                    return Err(StoreError::InvalidData {
                        column: "id",
                        message: format!("session {} already exists", session.id),
                    });
                }
                inner.sessions.insert(session.id.clone(), session);
                Ok(())
            })
        })
    }

    fn session(&self, id: &str) -> BoxFuture<'_, Result<Option<ChatSession>, StoreError>> {
        let id = id.to_owned();
        Box::pin(async move { self.read(|inner| Ok(inner.sessions.get(&id).cloned())) })
    }

    fn append_message(
        &self,
        session_id: &str,
        message: ChatMessage,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let session_id = session_id.to_owned();
        Box::pin(async move {
            self.write(|inner| {
                let session = inner
                    .sessions
                    .get_mut(&session_id)
                    .ok_or_else(|| StoreError::not_found("session", session_id.clone()))?;
                session.messages.push(message);
                session.updated_at = Utc::now();
                Ok(())
            })
        })
    }

    fn update_message(
        &self,
        session_id: &str,
        message: ChatMessage,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let session_id = session_id.to_owned();
        Box::pin(async move {
            self.write(|inner| {
                let session = inner
                    .sessions
                    .get_mut(&session_id)
                    .ok_or_else(|| StoreError::not_found("session", session_id.clone()))?;
                let existing = session
                    .messages
                    .iter_mut()
                    .find(|m| m.id == message.id)
                    .ok_or_else(|| StoreError::not_found("message", message.id.clone()))?;
                existing.content = message.content;
                existing.token_count = message.token_count;
                existing.chunk_refs = message.chunk_refs;
                existing.error = message.error;
                session.updated_at = Utc::now();
                Ok(())
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelens_llm::Role;

    fn chunk(id: &str, repo: &str, content: &str) -> CodeChunk {
        CodeChunk {
            id: id.into(),
            repository_id: repo.into(),
            file_path: format!("src/{id}.rs"),
            language: "rust".into(),
            start_line: 1,
            end_line: 1,
            content: content.into(),
            content_hash: id.into(),
            symbols: Vec::new(),
            vector_id: None,
            embedded_at: None,
        }
    }

    async fn seeded() -> InMemoryDocumentStore {
        let s = InMemoryDocumentStore::new();
        s.upsert_repository(Repository::new("r1", "one")).await.unwrap();
        s.upsert_chunks(vec![
            chunk("a", "r1", "database pool database"),
            chunk("b", "r1", "database"),
            chunk("c", "r2", "database"),
            chunk("d", "r1", "http server"),
        ])
        .await
        .unwrap();
        s
    }

    #[tokio::test]
    async fn text_search_orders_by_term_frequency() {
        let s = seeded().await;
        let hits = s.text_search(Some("r1"), "database", 10).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(
            hits[1].snippet.as_deref(),
            Some("<mark>database</mark>")
        );
    }

    #[tokio::test]
    async fn text_search_unscoped_and_limited() {
        let s = seeded().await;
        assert_eq!(s.text_search(None, "database", 10).await.unwrap().len(), 3);
        assert_eq!(s.text_search(None, "database", 1).await.unwrap().len(), 1);
        assert!(s.text_search(None, "", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_repository_returns_vector_ids() {
        let s = seeded().await;
        s.mark_embedded(vec![("a".into(), "a".into())], Utc::now())
            .await
            .unwrap();
        let ids = s.delete_repository("r1").await.unwrap();
        assert_eq!(ids, vec!["a".to_owned()]);
        assert!(s.chunks("r1").await.unwrap().is_empty());
        assert_eq!(s.chunks("r2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reupsert_keeps_vector_id() {
        let s = seeded().await;
        s.mark_embedded(vec![("b".into(), "b".into())], Utc::now())
            .await
            .unwrap();
        s.upsert_chunks(vec![chunk("b", "r1", "database")])
            .await
            .unwrap();
        assert!(s.chunk("b").await.unwrap().unwrap().is_embedded());
    }

    #[tokio::test]
    async fn sessions_append_and_update() {
        let s = InMemoryDocumentStore::new();
        s.create_session(ChatSession::new("s1", None, "t"))
            .await
            .unwrap();
        let mut msg = ChatMessage::new(Role::Assistant, "");
        s.append_message("s1", msg.clone()).await.unwrap();
        msg.content = "done".into();
        s.update_message("s1", msg).await.unwrap();
        let session = s.session("s1").await.unwrap().unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].content, "done");
        assert!(
            s.append_message("nope", ChatMessage::new(Role::User, "x"))
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn replace_files_requires_repository() {
        let s = InMemoryDocumentStore::new();
        let err = s.replace_files("r9", Vec::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
