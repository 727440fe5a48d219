//! Vector, lexical and hybrid retrieval over embedded chunks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use codelens_llm::LlmProvider;
use codelens_store::{
    CodeChunk, DocumentStore, ScoredVectorPoint, TextHit, VectorFilter, VectorStore,
    VectorStoreError,
};
use serde::Serialize;

use crate::error::{IndexError, Result};
use crate::fusion::{Candidate, fuse};
use crate::pipeline::embed_with_timeout;

/// Largest accepted result limit.
pub const MAX_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub collection: String,
    /// Each source fetches `limit × candidate_multiplier` candidates before fusion.
    pub candidate_multiplier: usize,
    pub embedding_timeout: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            collection: "code_chunks".into(),
            candidate_multiplier: 3,
            embedding_timeout: Duration::from_secs(30),
        }
    }
}

/// A retrieved chunk.
///
/// `score` is the fused score for hybrid search and the raw source score
/// (cosine similarity or text rank) for single-source searches.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk: CodeChunk,
    pub score: f32,
    pub vector_score: Option<f32>,
    pub text_score: Option<f32>,
    pub snippet: Option<String>,
}

pub struct HybridRetriever<P> {
    documents: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorStore>,
    provider: Arc<P>,
    config: RetrievalConfig,
}

impl<P> std::fmt::Debug for HybridRetriever<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridRetriever")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn check_limit(limit: usize) -> Result<()> {
    if (1..=MAX_LIMIT).contains(&limit) {
        Ok(())
    } else {
        Err(IndexError::InvalidLimit {
            value: limit,
            max: MAX_LIMIT,
        })
    }
}

fn check_weight(weight: f32) -> Result<()> {
    if (0.0..=1.0).contains(&weight) {
        Ok(())
    } else {
        Err(IndexError::InvalidWeight(weight))
    }
}

/// Chunk id of a vector hit; points are keyed by chunk id, the payload
/// field wins when present.
fn point_chunk_id(point: &ScoredVectorPoint) -> String {
    point
        .payload
        .get("chunk_id")
        .and_then(serde_json::Value::as_str)
        .map_or_else(|| point.id.clone(), str::to_owned)
}

impl<P: LlmProvider> HybridRetriever<P> {
    #[must_use]
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorStore>,
        provider: Arc<P>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            documents,
            vectors,
            provider,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Nearest chunks to the embedded query.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidLimit`] for a limit outside `1..=100` and
    /// [`IndexError::Unavailable`] when the provider or an index fails.
    pub async fn vector_search(
        &self,
        repository_id: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        check_limit(limit)?;
        let candidates = self.vector_candidates(repository_id, query, limit).await?;
        let chunks = self
            .load_chunks(candidates.iter().map(|c| c.chunk_id.clone()).collect())
            .await?;
        let results = candidates
            .into_iter()
            .filter_map(|c| {
                chunks.get(&c.chunk_id).map(|chunk| SearchResult {
                    chunk: chunk.clone(),
                    score: c.score,
                    vector_score: Some(c.score),
                    text_score: None,
                    snippet: None,
                })
            })
            .collect();
        Ok(results)
    }

    /// Chunks ranked by the document store's text index.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidLimit`] for a limit outside `1..=100` and
    /// [`IndexError::Unavailable`] when the document store fails.
    pub async fn text_search(
        &self,
        repository_id: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        check_limit(limit)?;
        let hits = self.text_hits(repository_id, query, limit).await?;
        Ok(hits
            .into_iter()
            .map(|hit| SearchResult {
                score: hit.score,
                text_score: Some(hit.score),
                vector_score: None,
                snippet: hit.snippet,
                chunk: hit.chunk,
            })
            .collect())
    }

    /// Vector and text results fused as `w·vector + (1 − w)·text` over
    /// min-max normalized scores.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidLimit`], [`IndexError::InvalidWeight`] for
    /// bad arguments and [`IndexError::Unavailable`] when a source fails.
    pub async fn hybrid_search(
        &self,
        repository_id: Option<&str>,
        query: &str,
        vector_weight: f32,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        check_limit(limit)?;
        check_weight(vector_weight)?;
        let candidates = limit.saturating_mul(self.config.candidate_multiplier.max(1));

        let (vector, hits) = tokio::try_join!(
            self.vector_candidates(repository_id, query, candidates),
            self.text_hits(repository_id, query, candidates),
        )?;

        let text: Vec<Candidate> = hits
            .iter()
            .map(|h| Candidate::new(h.chunk.id.as_str(), h.score))
            .collect();
        let mut fused = fuse(&vector, &text, vector_weight);
        fused.truncate(limit);

        let mut known: HashMap<String, TextHit> = hits
            .into_iter()
            .map(|h| (h.chunk.id.clone(), h))
            .collect();
        let missing: Vec<String> = fused
            .iter()
            .filter(|f| !known.contains_key(&f.chunk_id))
            .map(|f| f.chunk_id.clone())
            .collect();
        let loaded = self.load_chunks(missing).await?;

        let results: Vec<SearchResult> = fused
            .into_iter()
            .filter_map(|f| {
                let (chunk, snippet) = match known.remove(&f.chunk_id) {
                    Some(hit) => (hit.chunk, hit.snippet),
                    None => (loaded.get(&f.chunk_id)?.clone(), None),
                };
                Some(SearchResult {
                    chunk,
                    score: f.score,
                    vector_score: f.vector_score,
                    text_score: f.text_score,
                    snippet,
                })
            })
            .collect();

        tracing::debug!(
            repository_id = repository_id.unwrap_or("*"),
            vector_weight,
            results = results.len(),
            "hybrid search"
        );
        Ok(results)
    }

    /// Chunks closest to `chunk_id` within its repository, excluding itself.
    ///
    /// A chunk without a stored vector has no neighbours.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::ChunkNotFound`] for an unknown chunk and
    /// [`IndexError::Unavailable`] when an index fails.
    pub async fn find_similar(&self, chunk_id: &str, limit: usize) -> Result<Vec<SearchResult>> {
        check_limit(limit)?;
        let chunk = self
            .documents
            .chunk(chunk_id)
            .await
            .map_err(|e| IndexError::unavailable("load_chunk", "document store", e))?
            .ok_or_else(|| IndexError::ChunkNotFound(chunk_id.to_owned()))?;

        let Some(vector_id) = chunk.vector_id.clone() else {
            tracing::debug!(chunk_id, "chunk has no vector yet");
            return Ok(Vec::new());
        };
        let collection = self.config.collection.as_str();
        let stored = match self.vectors.retrieve(collection, vec![vector_id]).await {
            Ok(stored) => stored,
            Err(VectorStoreError::CollectionNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(IndexError::unavailable("retrieve_vectors", collection, e)),
        };
        let Some(source) = stored.into_iter().next() else {
            tracing::warn!(chunk_id, "stored vector is missing from the index");
            return Ok(Vec::new());
        };

        let filter = VectorFilter::default()
            .must_text("repository_id", chunk.repository_id.as_str())
            .must_not_text("chunk_id", chunk.id.as_str());
        let points = self
            .search_points(source.vector, limit, Some(filter))
            .await?;
        let hits: Vec<Candidate> = points
            .iter()
            .map(|p| Candidate::new(point_chunk_id(p), p.score))
            .filter(|c| c.chunk_id != chunk.id)
            .collect();

        let chunks = self
            .load_chunks(hits.iter().map(|c| c.chunk_id.clone()).collect())
            .await?;
        Ok(hits
            .into_iter()
            .filter_map(|c| {
                chunks.get(&c.chunk_id).map(|found| SearchResult {
                    chunk: found.clone(),
                    score: c.score,
                    vector_score: Some(c.score),
                    text_score: None,
                    snippet: None,
                })
            })
            .collect())
    }

    async fn vector_candidates(
        &self,
        repository_id: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut vectors = embed_with_timeout(
            self.provider.as_ref(),
            &[query.to_owned()],
            self.config.embedding_timeout,
        )
        .await?;
        let Some(query_vector) = vectors.pop() else {
            return Ok(Vec::new());
        };
        let filter =
            repository_id.map(|repo| VectorFilter::default().must_text("repository_id", repo));
        let points = self.search_points(query_vector, limit, filter).await?;
        Ok(points
            .iter()
            .map(|p| Candidate::new(point_chunk_id(p), p.score))
            .collect())
    }

    async fn search_points(
        &self,
        vector: Vec<f32>,
        limit: usize,
        filter: Option<VectorFilter>,
    ) -> Result<Vec<ScoredVectorPoint>> {
        let collection = self.config.collection.as_str();
        let limit = u64::try_from(limit).unwrap_or(u64::MAX);
        match self
            .vectors
            .search(collection, vector, limit, true, filter)
            .await
        {
            Ok(points) => Ok(points),
            // Nothing has been embedded yet.
            Err(VectorStoreError::CollectionNotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(IndexError::unavailable("vector_search", collection, e)),
        }
    }

    async fn text_hits(
        &self,
        repository_id: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<TextHit>> {
        self.documents
            .text_search(repository_id, query, limit)
            .await
            .map_err(|e| IndexError::unavailable("text_search", "document store", e))
    }

    async fn load_chunks(&self, ids: Vec<String>) -> Result<HashMap<String, CodeChunk>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let chunks = self
            .documents
            .chunks_by_ids(ids)
            .await
            .map_err(|e| IndexError::unavailable("load_chunks", "document store", e))?;
        Ok(chunks.into_iter().map(|c| (c.id.clone(), c)).collect())
    }
}

#[cfg(test)]
mod tests {
    use codelens_llm::mock::MockProvider;
    use codelens_store::{InMemoryDocumentStore, InMemoryVectorStore, Repository, SourceFile};

    use super::*;
    use crate::pipeline::{EmbeddingPipeline, PipelineConfig};
    use crate::status::StatusTracker;

    struct Fixture {
        retriever: HybridRetriever<MockProvider>,
        documents: Arc<InMemoryDocumentStore>,
    }

    fn file(repo: &str, path: &str, content: &str) -> SourceFile {
        SourceFile {
            repository_id: repo.into(),
            path: path.into(),
            language: "rust".into(),
            content: content.into(),
        }
    }

    async fn fixture() -> Fixture {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let vectors = Arc::new(InMemoryVectorStore::new());
        let provider = Arc::new(MockProvider::default());

        for (repo, files) in [
            (
                "r1",
                vec![
                    file("r1", "db.rs", "fn open_database() { connect database pool }"),
                    file("r1", "db_copy.rs", "fn open_database() { connect database pool }"),
                    file("r1", "http.rs", "fn serve_http() { listen socket request }"),
                    file("r1", "parse.rs", "fn parse_config() { read toml file }"),
                ],
            ),
            (
                "r2",
                vec![file("r2", "other.rs", "fn open_database() { connect database pool }")],
            ),
        ] {
            documents
                .upsert_repository(Repository::new(repo, repo))
                .await
                .unwrap();
            documents.replace_files(repo, files).await.unwrap();
        }

        let pipeline = EmbeddingPipeline::new(
            documents.clone(),
            vectors.clone(),
            provider.clone(),
            Arc::new(StatusTracker::new(Duration::from_secs(60))),
            PipelineConfig::default(),
        )
        .unwrap();
        pipeline.process_repository("r1").await.unwrap();
        pipeline.process_repository("r2").await.unwrap();

        Fixture {
            retriever: HybridRetriever::new(
                documents.clone(),
                vectors,
                provider,
                RetrievalConfig::default(),
            ),
            documents,
        }
    }

    async fn chunk_of(documents: &InMemoryDocumentStore, repo: &str, path: &str) -> CodeChunk {
        documents
            .chunks(repo)
            .await
            .unwrap()
            .into_iter()
            .find(|c| c.file_path == path)
            .unwrap()
    }

    #[tokio::test]
    async fn vector_search_is_scoped_to_repository() {
        let f = fixture().await;
        let results = f
            .retriever
            .vector_search(Some("r1"), "connect database pool", 10)
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert!(results.iter().all(|r| r.chunk.repository_id == "r1"));
        assert!(results[0].chunk.file_path.starts_with("db"));

        let all = f
            .retriever
            .vector_search(None, "connect database pool", 10)
            .await
            .unwrap();
        assert!(all.iter().any(|r| r.chunk.repository_id == "r2"));
    }

    #[tokio::test]
    async fn text_search_returns_snippets() {
        let f = fixture().await;
        let results = f
            .retriever
            .text_search(Some("r1"), "socket", 5)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.file_path, "http.rs");
        assert!(results[0].snippet.is_some());
    }

    #[tokio::test]
    async fn hybrid_scores_are_bounded_and_sorted() {
        let f = fixture().await;
        let results = f
            .retriever
            .hybrid_search(Some("r1"), "parse toml config", 0.7, 3)
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert!(results.len() <= 3);
        assert_eq!(results[0].chunk.file_path, "parse.rs");
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        for r in &results {
            assert!((0.0..=1.0).contains(&r.score));
            let expected = 0.7 * r.vector_score.unwrap_or(0.0)
                + 0.3 * r.text_score.unwrap_or(0.0);
            assert!((r.score - expected).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected() {
        let f = fixture().await;
        assert!(matches!(
            f.retriever.hybrid_search(None, "x", 0.5, 0).await,
            Err(IndexError::InvalidLimit { value: 0, max: 100 })
        ));
        assert!(matches!(
            f.retriever.hybrid_search(None, "x", 0.5, 101).await,
            Err(IndexError::InvalidLimit { .. })
        ));
        assert!(matches!(
            f.retriever.hybrid_search(None, "x", 1.5, 10).await,
            Err(IndexError::InvalidWeight(_))
        ));
        assert!(matches!(
            f.retriever.find_similar("c", 0).await,
            Err(IndexError::InvalidLimit { .. })
        ));
    }

    #[tokio::test]
    async fn find_similar_excludes_source_and_other_repositories() {
        let f = fixture().await;
        let source = chunk_of(&f.documents, "r1", "db.rs").await;
        let similar = f.retriever.find_similar(&source.id, 5).await.unwrap();

        assert!(!similar.is_empty());
        assert!(similar.iter().all(|r| r.chunk.id != source.id));
        assert!(similar.iter().all(|r| r.chunk.repository_id == "r1"));
        assert_eq!(similar[0].chunk.file_path, "db_copy.rs");
    }

    #[tokio::test]
    async fn find_similar_unknown_chunk() {
        let f = fixture().await;
        let err = f.retriever.find_similar("missing", 5).await.unwrap_err();
        assert!(matches!(err, IndexError::ChunkNotFound(_)));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn searching_before_any_embedding_is_empty() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let retriever = HybridRetriever::new(
            documents,
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(MockProvider::default()),
            RetrievalConfig::default(),
        );
        assert!(
            retriever
                .hybrid_search(None, "anything", 0.5, 5)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn provider_outage_is_unavailable() {
        let retriever = HybridRetriever::new(
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(MockProvider::failing()),
            RetrievalConfig::default(),
        );
        let err = retriever
            .vector_search(None, "query", 5)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IndexError::Unavailable {
                operation: "embed_batch",
                ..
            }
        ));
        assert!(err.is_retryable());
    }
}
