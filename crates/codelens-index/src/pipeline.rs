//! Repository embedding pipeline: chunk → reconcile → deduplicate → embed in
//! batches → write vectors, with a bounded job queue in front.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use codelens_llm::{LlmError, LlmProvider};
use codelens_store::{CodeChunk, DocumentStore, Payload, VectorPoint, VectorStore};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::chunker::{ChunkerConfig, chunk_file};
use crate::context::contextualize_for_embedding;
use crate::error::{IndexError, Result};
use crate::queue::{EmbeddingJob, JobQueue, PushError};
use crate::status::{EmbeddingStatus, ProcessingStats, StatusTracker};

/// Text embedded once to learn the vector dimension of a new collection.
const DIMENSION_PROBE: &str = "dimension probe";

/// What to do when the job queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Refuse the job with [`IndexError::QueueFull`].
    Reject,
    /// Process the repository on a detached task instead.
    #[default]
    Fallback,
}

impl FromStr for OverflowPolicy {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "fallback" => Ok(Self::Fallback),
            other => Err(IndexError::InvalidConfig(format!(
                "unknown overflow policy: {other}"
            ))),
        }
    }
}

/// How a queued repository will be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOutcome {
    Queued,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub collection: String,
    pub chunker: ChunkerConfig,
    /// Distinct texts per embedding call.
    pub batch_size: usize,
    /// Size of both the job worker pool and the per-run batch worker pool.
    pub workers: usize,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// A run fails when `failed / total` exceeds this ratio.
    pub failure_tolerance: f64,
    pub embedding_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            collection: "code_chunks".into(),
            chunker: ChunkerConfig::default(),
            batch_size: 50,
            workers: 3,
            queue_capacity: 100,
            overflow_policy: OverflowPolicy::Fallback,
            failure_tolerance: 0.25,
            embedding_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| Err(IndexError::InvalidConfig(msg.to_owned()));
        if self.collection.trim().is_empty() {
            return bad("collection must not be empty");
        }
        if self.batch_size == 0 {
            return bad("batch_size must be greater than zero");
        }
        if self.workers == 0 {
            return bad("workers must be greater than zero");
        }
        if self.queue_capacity == 0 {
            return bad("queue_capacity must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.failure_tolerance) {
            return bad("failure_tolerance must be within [0, 1]");
        }
        if self.embedding_timeout.is_zero() {
            return bad("embedding timeout must be greater than zero");
        }
        Ok(())
    }
}

/// Chunks sharing a content hash and language, embedded through one text.
struct ChunkGroup {
    text: String,
    chunks: Vec<CodeChunk>,
}

struct Inner<P> {
    documents: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorStore>,
    provider: Arc<P>,
    status: Arc<StatusTracker>,
    queue: JobQueue,
    config: PipelineConfig,
}

/// Embeds repositories and tracks their progress.
///
/// Cheap to clone; clones share the queue, status tracker and stores.
pub struct EmbeddingPipeline<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for EmbeddingPipeline<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> std::fmt::Debug for EmbeddingPipeline<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingPipeline")
            .field("config", &self.inner.config)
            .field("queue", &self.inner.queue)
            .finish_non_exhaustive()
    }
}

impl<P: LlmProvider + 'static> EmbeddingPipeline<P> {
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidConfig`] if `config` does not validate.
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorStore>,
        provider: Arc<P>,
        status: Arc<StatusTracker>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                documents,
                vectors,
                provider,
                status,
                queue: JobQueue::new(config.queue_capacity),
                config,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn status_tracker(&self) -> &Arc<StatusTracker> {
        &self.inner.status
    }

    /// Jobs waiting for a worker.
    #[must_use]
    pub fn queued_jobs(&self) -> usize {
        self.inner.queue.len()
    }

    /// Enqueue a repository for embedding without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::RepositoryNotFound`] for unknown repositories and
    /// [`IndexError::QueueFull`] when the queue is full under
    /// [`OverflowPolicy::Reject`].
    pub async fn queue_repository(
        &self,
        repository_id: &str,
        priority: i32,
    ) -> Result<QueueOutcome> {
        self.inner.require_repository(repository_id).await?;

        let status = &self.inner.status;
        let previous = status.get(repository_id);
        status.mark_pending(repository_id);

        let rejected = match self
            .inner
            .queue
            .try_push(EmbeddingJob::new(repository_id, priority))
        {
            Ok(()) => {
                tracing::info!(repository_id, priority, "embedding job queued");
                return Ok(QueueOutcome::Queued);
            }
            Err(err) => err,
        };

        let closed = matches!(rejected, PushError::Closed(_));
        match self.inner.config.overflow_policy {
            OverflowPolicy::Reject => {
                status.restore(repository_id, previous);
                tracing::warn!(repository_id, closed, "embedding queue rejected job");
                Err(IndexError::QueueFull {
                    capacity: self.inner.queue.capacity(),
                })
            }
            OverflowPolicy::Fallback => {
                tracing::info!(
                    repository_id,
                    closed,
                    "embedding queue full, processing on a detached task"
                );
                let pipeline = self.clone();
                let repository_id = rejected.into_job().repository_id;
                tokio::spawn(async move {
                    if let Err(e) = pipeline.process_repository(&repository_id).await {
                        tracing::error!(
                            repository_id = %repository_id,
                            "fallback embedding run failed: {e}"
                        );
                    }
                });
                Ok(QueueOutcome::Fallback)
            }
        }
    }

    /// Embed every chunk of a repository that does not have a vector yet.
    ///
    /// A repository that is already processing is left alone and its current
    /// status returned.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::RepositoryNotFound`] for unknown repositories, or
    /// the error that aborted the run (the status is then `failed`).
    pub async fn process_repository(&self, repository_id: &str) -> Result<EmbeddingStatus> {
        self.inner.require_repository(repository_id).await?;

        if let Err(current) = self.inner.status.begin(repository_id, Utc::now()) {
            tracing::debug!(repository_id, "repository already processing");
            return Ok(current);
        }
        tracing::info!(repository_id, "embedding run started");

        match self.inner.run(repository_id).await {
            Ok(status) => {
                tracing::info!(
                    repository_id,
                    state = ?status.state,
                    processed = status.processed_chunks,
                    failed = status.failed_chunks,
                    skipped = status.skipped_chunks,
                    "embedding run finished"
                );
                Ok(status)
            }
            Err(e) => {
                self.inner
                    .status
                    .update(repository_id, |s| s.fail(e.to_string(), Utc::now()));
                tracing::error!(repository_id, "embedding run aborted: {e}");
                Err(e)
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`IndexError::RepositoryNotFound`] if there is neither a status
    /// nor a repository with this id.
    pub async fn get_status(&self, repository_id: &str) -> Result<EmbeddingStatus> {
        if let Some(status) = self.inner.status.get(repository_id) {
            return Ok(status);
        }
        self.inner.require_repository(repository_id).await?;
        Ok(EmbeddingStatus::pending(repository_id))
    }

    /// # Errors
    ///
    /// Same as [`EmbeddingPipeline::get_status`].
    pub async fn get_stats(&self, repository_id: &str) -> Result<ProcessingStats> {
        let status = self.get_status(repository_id).await?;
        Ok(ProcessingStats::from_status(status, Utc::now()))
    }

    /// Spawn `workers` job consumers. They exit when `cancel` fires or the
    /// queue is closed and drained.
    #[must_use]
    pub fn start_workers(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.inner.config.workers)
            .map(|worker| {
                let pipeline = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let job = tokio::select! {
                            () = cancel.cancelled() => break,
                            job = pipeline.inner.queue.pop() => job,
                        };
                        let Some(job) = job else { break };
                        tracing::debug!(
                            worker,
                            repository_id = %job.repository_id,
                            priority = job.priority,
                            "embedding job dequeued"
                        );
                        if let Err(e) = pipeline.process_repository(&job.repository_id).await {
                            tracing::error!(
                                worker,
                                repository_id = %job.repository_id,
                                "embedding job failed: {e}"
                            );
                        }
                    }
                    tracing::debug!(worker, "embedding worker stopped");
                })
            })
            .collect()
    }

    /// Stop accepting jobs. Workers drain what is queued, then exit.
    pub fn shutdown(&self) {
        self.inner.queue.close();
    }

    /// Delete a repository with its chunks, vectors and status. Returns the
    /// number of vectors removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository is unknown or a store fails.
    pub async fn remove_repository(&self, repository_id: &str) -> Result<usize> {
        self.inner.require_repository(repository_id).await?;
        let vector_ids = self.inner.documents.delete_repository(repository_id).await?;
        let removed = vector_ids.len();
        if !vector_ids.is_empty() {
            let collection = &self.inner.config.collection;
            self.inner
                .vectors
                .delete(collection, vector_ids)
                .await
                .map_err(|e| IndexError::unavailable("delete_vectors", collection.as_str(), e))?;
        }
        self.inner.status.remove(repository_id);
        tracing::info!(repository_id, removed, "repository removed");
        Ok(removed)
    }
}

impl<P: LlmProvider + 'static> Inner<P> {
    async fn require_repository(&self, repository_id: &str) -> Result<()> {
        match self.documents.repository(repository_id).await? {
            Some(_) => Ok(()),
            None => Err(IndexError::RepositoryNotFound(repository_id.to_owned())),
        }
    }

    async fn run(self: &Arc<Self>, repository_id: &str) -> Result<EmbeddingStatus> {
        let files = self.documents.files(repository_id).await?;
        let mut chunks: Vec<CodeChunk> = files
            .iter()
            .flat_map(|f| {
                chunk_file(
                    repository_id,
                    &f.path,
                    &f.language,
                    &f.content,
                    &self.config.chunker,
                )
            })
            .collect();

        let existing = self.documents.chunks(repository_id).await?;
        let fresh_ids: HashSet<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let (kept, stale): (Vec<CodeChunk>, Vec<CodeChunk>) = existing
            .into_iter()
            .partition(|c| fresh_ids.contains(&c.id));
        self.remove_stale(repository_id, stale).await?;

        let kept: HashMap<String, CodeChunk> =
            kept.into_iter().map(|c| (c.id.clone(), c)).collect();
        for chunk in &mut chunks {
            if let Some(old) = kept.get(&chunk.id) {
                chunk.vector_id.clone_from(&old.vector_id);
                chunk.embedded_at = old.embedded_at;
            }
        }
        self.documents.upsert_chunks(chunks.clone()).await?;

        let total = chunks.len();
        let (embedded, pending): (Vec<CodeChunk>, Vec<CodeChunk>) =
            chunks.into_iter().partition(CodeChunk::is_embedded);
        let mut skipped = embedded.len();

        let pending = if pending.is_empty() {
            pending
        } else {
            self.ensure_collection().await?;
            let (reused, rest) = self.reuse_vectors(repository_id, &embedded, pending).await;
            skipped += reused;
            rest
        };

        let batches = into_batches(group_by_content(pending), self.config.batch_size);
        let batch_count = batches.len();
        self.status
            .update(repository_id, |s| s.plan(total, skipped, batch_count));
        tracing::info!(
            repository_id,
            total,
            skipped,
            batches = batch_count,
            "embedding run planned"
        );

        if !batches.is_empty() {
            self.embed_batches(repository_id, batches).await;
        }

        let tolerance = self.config.failure_tolerance;
        self.status
            .update(repository_id, |s| s.finish(tolerance, Utc::now()))
            .ok_or_else(|| IndexError::RepositoryNotFound(repository_id.to_owned()))
    }

    async fn remove_stale(&self, repository_id: &str, stale: Vec<CodeChunk>) -> Result<()> {
        if stale.is_empty() {
            return Ok(());
        }
        let vector_ids: Vec<String> = stale.iter().filter_map(|c| c.vector_id.clone()).collect();
        if !vector_ids.is_empty()
            && let Err(e) = self
                .vectors
                .delete(&self.config.collection, vector_ids)
                .await
        {
            tracing::warn!(repository_id, "failed to delete stale vectors: {e}");
        }
        let removed = stale.len();
        self.documents
            .delete_chunks(stale.into_iter().map(|c| c.id).collect())
            .await?;
        tracing::debug!(repository_id, removed, "stale chunks removed");
        Ok(())
    }

    async fn ensure_collection(&self) -> Result<()> {
        let collection = self.config.collection.as_str();
        let exists = self
            .vectors
            .exists(collection)
            .await
            .map_err(|e| IndexError::unavailable("collection_exists", collection, e))?;
        if exists {
            return Ok(());
        }

        let probe = embed_with_timeout(
            self.provider.as_ref(),
            &[DIMENSION_PROBE.to_owned()],
            self.config.embedding_timeout,
        )
        .await?;
        let dimension = probe.first().map_or(0, Vec::len);
        if dimension == 0 {
            return Err(IndexError::unavailable(
                "embed_batch",
                self.provider.name(),
                LlmError::EmptyResponse {
                    provider: self.provider.name().to_owned(),
                },
            ));
        }
        let dimension = u64::try_from(dimension).unwrap_or(u64::MAX);
        self.vectors
            .create_collection(collection, dimension)
            .await
            .map_err(|e| IndexError::unavailable("create_collection", collection, e))?;
        tracing::info!(collection, dimension, "vector collection created");
        Ok(())
    }

    /// Give pending chunks whose (hash, language) already has a vector in this
    /// repository a point of their own without calling the provider.
    /// Returns how many were served that way and the chunks still pending.
    async fn reuse_vectors(
        &self,
        repository_id: &str,
        embedded: &[CodeChunk],
        pending: Vec<CodeChunk>,
    ) -> (usize, Vec<CodeChunk>) {
        let by_key: HashMap<(&str, &str), &str> = embedded
            .iter()
            .filter_map(|c| {
                c.vector_id
                    .as_deref()
                    .map(|v| ((c.content_hash.as_str(), c.language.as_str()), v))
            })
            .collect();
        let source_of =
            |c: &CodeChunk| by_key.get(&(c.content_hash.as_str(), c.language.as_str())).copied();

        let (reusable, mut rest): (Vec<CodeChunk>, Vec<CodeChunk>) =
            pending.into_iter().partition(|c| source_of(c).is_some());
        if reusable.is_empty() {
            return (0, rest);
        }

        let source_ids: Vec<String> = reusable
            .iter()
            .filter_map(source_of)
            .map(str::to_owned)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let collection = &self.config.collection;
        let vectors: HashMap<String, Vec<f32>> =
            match self.vectors.retrieve(collection, source_ids).await {
                Ok(found) => found.into_iter().map(|r| (r.id, r.vector)).collect(),
                Err(e) => {
                    tracing::warn!(repository_id, "vector reuse lookup failed: {e}");
                    rest.extend(reusable);
                    return (0, rest);
                }
            };

        let mut points = Vec::new();
        let mut reused = Vec::new();
        for chunk in reusable {
            match source_of(&chunk).and_then(|id| vectors.get(id)) {
                Some(vector) => {
                    points.push(VectorPoint {
                        id: chunk.id.clone(),
                        vector: vector.clone(),
                        payload: chunk_payload(&chunk),
                    });
                    reused.push(chunk);
                }
                None => rest.push(chunk),
            }
        }
        if reused.is_empty() {
            return (0, rest);
        }

        let updates: Vec<(String, String)> =
            reused.iter().map(|c| (c.id.clone(), c.id.clone())).collect();
        let written = match self.vectors.upsert(collection, points).await {
            Ok(()) => self
                .documents
                .mark_embedded(updates, Utc::now())
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = written {
            tracing::warn!(repository_id, "vector reuse write failed: {e}");
            rest.extend(reused);
            return (0, rest);
        }

        tracing::debug!(repository_id, reused = reused.len(), "reused existing vectors");
        (reused.len(), rest)
    }

    async fn embed_batches(self: &Arc<Self>, repository_id: &str, batches: Vec<Vec<ChunkGroup>>) {
        let workers = self.config.workers.clamp(1, batches.len().max(1));
        let (tx, rx) = mpsc::channel::<(usize, Vec<ChunkGroup>)>(workers);
        let rx = Arc::new(Mutex::new(rx));

        let mut set = JoinSet::new();
        for _ in 0..workers {
            let inner = Arc::clone(self);
            let rx = Arc::clone(&rx);
            let repository_id = repository_id.to_owned();
            set.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some((index, batch)) = next else { break };
                    inner.embed_batch(&repository_id, index, batch).await;
                }
            });
        }

        for (index, batch) in batches.into_iter().enumerate() {
            if tx.send((index, batch)).await.is_err() {
                tracing::error!(repository_id, "all embedding workers exited early");
                break;
            }
        }
        drop(tx);

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(repository_id, "embedding worker panicked: {e}");
            }
        }
    }

    async fn embed_batch(&self, repository_id: &str, index: usize, batch: Vec<ChunkGroup>) {
        let chunks: usize = batch.iter().map(|g| g.chunks.len()).sum();
        let succeeded = match self.write_batch(&batch).await {
            Ok(()) => {
                tracing::debug!(repository_id, batch = index, chunks, "batch embedded");
                true
            }
            Err(e) => {
                tracing::warn!(repository_id, batch = index, failed = chunks, "batch failed: {e}");
                false
            }
        };
        if let Some(status) = self
            .status
            .update(repository_id, |s| s.record_batch(chunks, succeeded, Utc::now()))
        {
            tracing::info!(
                repository_id,
                batch = index,
                progress = status.progress,
                "embedding progress"
            );
        }
    }

    async fn write_batch(&self, batch: &[ChunkGroup]) -> Result<()> {
        let texts: Vec<String> = batch.iter().map(|g| g.text.clone()).collect();
        let vectors =
            embed_with_timeout(self.provider.as_ref(), &texts, self.config.embedding_timeout)
                .await?;

        let mut points = Vec::new();
        let mut updates = Vec::new();
        for (group, vector) in batch.iter().zip(vectors) {
            for chunk in &group.chunks {
                points.push(VectorPoint {
                    id: chunk.id.clone(),
                    vector: vector.clone(),
                    payload: chunk_payload(chunk),
                });
                updates.push((chunk.id.clone(), chunk.id.clone()));
            }
        }

        let collection = self.config.collection.as_str();
        self.vectors
            .upsert(collection, points)
            .await
            .map_err(|e| IndexError::unavailable("upsert_vectors", collection, e))?;
        self.documents
            .mark_embedded(updates, Utc::now())
            .await
            .map_err(|e| IndexError::unavailable("mark_embedded", "document store", e))?;
        Ok(())
    }
}

/// One embedding call bounded by `timeout`, checked for one vector per text.
pub(crate) async fn embed_with_timeout<P: LlmProvider>(
    provider: &P,
    texts: &[String],
    timeout: Duration,
) -> Result<Vec<Vec<f32>>> {
    let vectors = match tokio::time::timeout(timeout, provider.embed_batch(texts)).await {
        Ok(Ok(vectors)) => vectors,
        Ok(Err(e)) => return Err(IndexError::unavailable("embed_batch", provider.name(), e)),
        Err(_) => {
            return Err(IndexError::unavailable(
                "embed_batch",
                provider.name(),
                LlmError::Timeout {
                    operation: "embed_batch",
                    seconds: timeout.as_secs(),
                },
            ));
        }
    };
    if vectors.len() != texts.len() {
        return Err(IndexError::unavailable(
            "embed_batch",
            provider.name(),
            LlmError::EmbeddingCountMismatch {
                expected: texts.len(),
                actual: vectors.len(),
            },
        ));
    }
    Ok(vectors)
}

fn group_by_content(chunks: Vec<CodeChunk>) -> Vec<ChunkGroup> {
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut groups: Vec<ChunkGroup> = Vec::new();
    for chunk in chunks {
        let key = (chunk.content_hash.clone(), chunk.language.clone());
        if let Some(&i) = index.get(&key) {
            groups[i].chunks.push(chunk);
        } else {
            index.insert(key, groups.len());
            groups.push(ChunkGroup {
                text: contextualize_for_embedding(&chunk),
                chunks: vec![chunk],
            });
        }
    }
    groups
}

fn into_batches(groups: Vec<ChunkGroup>, batch_size: usize) -> Vec<Vec<ChunkGroup>> {
    let mut batches = Vec::new();
    let mut groups = groups.into_iter().peekable();
    while groups.peek().is_some() {
        batches.push(groups.by_ref().take(batch_size).collect());
    }
    batches
}

/// Payload written with every chunk vector.
#[must_use]
pub fn chunk_payload(chunk: &CodeChunk) -> Payload {
    let mut payload = Payload::new();
    payload.insert("repository_id".into(), chunk.repository_id.as_str().into());
    payload.insert("chunk_id".into(), chunk.id.as_str().into());
    payload.insert("file_path".into(), chunk.file_path.as_str().into());
    payload.insert("language".into(), chunk.language.as_str().into());
    payload.insert("start_line".into(), chunk.start_line.into());
    payload.insert("end_line".into(), chunk.end_line.into());
    payload.insert("content_hash".into(), chunk.content_hash.as_str().into());
    payload.insert("symbols".into(), chunk.symbols.clone().into());
    payload
}
