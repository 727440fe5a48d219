//! `CodeLens`: the operations exposed to callers, wired from one [`Config`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use codelens_index::{
    EmbeddingPipeline, EmbeddingStatus, HybridRetriever, ImportReport, ProcessingStats,
    QueueOutcome, SearchResult, StatusTracker,
};
use codelens_llm::LlmProvider;
use codelens_store::{ChatSession, DocumentStore, Repository, VectorStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chat::{ChatOrchestrator, ResponseStream};
use crate::config::Config;
use crate::error::{ChatError, ConfigError};

pub struct CodeLens<P> {
    documents: Arc<dyn DocumentStore>,
    pipeline: EmbeddingPipeline<P>,
    retriever: Arc<HybridRetriever<P>>,
    chat: ChatOrchestrator<P>,
    status: Arc<StatusTracker>,
    eviction_interval: Duration,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    eviction: Mutex<Option<JoinHandle<()>>>,
}

impl<P> std::fmt::Debug for CodeLens<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeLens")
            .field("pipeline", &self.pipeline)
            .field("tracked_statuses", &self.status.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<P: LlmProvider + 'static> CodeLens<P> {
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `config` does not validate.
    pub fn new(
        config: &Config,
        documents: Arc<dyn DocumentStore>,
        vectors: Arc<dyn VectorStore>,
        provider: Arc<P>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let status = Arc::new(StatusTracker::new(config.status_ttl()));
        let pipeline = EmbeddingPipeline::new(
            Arc::clone(&documents),
            Arc::clone(&vectors),
            Arc::clone(&provider),
            Arc::clone(&status),
            config.pipeline_config()?,
        )?;
        let retriever = Arc::new(HybridRetriever::new(
            Arc::clone(&documents),
            vectors,
            Arc::clone(&provider),
            config.retrieval_config(),
        ));
        let chat = ChatOrchestrator::new(
            Arc::clone(&documents),
            Arc::clone(&retriever),
            provider,
            config.chat_settings(),
        );

        Ok(Self {
            documents,
            pipeline,
            retriever,
            chat,
            status,
            eviction_interval: config.eviction_interval(),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            eviction: Mutex::new(None),
        })
    }

    /// Spawn the embedding workers and the status eviction task.
    ///
    /// Calling it again while they run does nothing.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() {
            return;
        }
        workers.extend(self.pipeline.start_workers(self.cancel.child_token()));

        let eviction = Arc::clone(&self.status)
            .spawn_eviction(self.eviction_interval, self.cancel.child_token());
        *self.eviction.lock().unwrap_or_else(PoisonError::into_inner) = Some(eviction);
        tracing::info!(
            workers = workers.len(),
            eviction_interval_secs = self.eviction_interval.as_secs(),
            "codelens started"
        );
    }

    /// Stop accepting jobs, let workers drain the queue, then stop every
    /// background task.
    pub async fn shutdown(&self) {
        self.pipeline.shutdown();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::warn!("embedding worker panicked: {e}");
            }
        }

        self.cancel.cancel();
        let eviction = self
            .eviction
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = eviction
            && let Err(e) = handle.await
        {
            tracing::warn!("status eviction task panicked: {e}");
        }
        tracing::info!("codelens stopped");
    }

    /// Token cancelled by [`CodeLens::shutdown`]; streams can hang children
    /// off it.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or the store fails.
    pub async fn import_directory(
        &self,
        repository_id: &str,
        name: &str,
        root: PathBuf,
    ) -> codelens_index::Result<ImportReport> {
        let repository =
            Repository::new(repository_id, name).with_root_path(root.display().to_string());
        codelens_index::import_directory(self.documents.as_ref(), repository, root).await
    }

    /// # Errors
    ///
    /// See [`EmbeddingPipeline::queue_repository`].
    pub async fn queue_repository(
        &self,
        repository_id: &str,
        priority: i32,
    ) -> codelens_index::Result<QueueOutcome> {
        self.pipeline.queue_repository(repository_id, priority).await
    }

    /// Embed a repository on the calling task, bypassing the queue.
    ///
    /// # Errors
    ///
    /// See [`EmbeddingPipeline::process_repository`].
    pub async fn process_repository(
        &self,
        repository_id: &str,
    ) -> codelens_index::Result<EmbeddingStatus> {
        self.pipeline.process_repository(repository_id).await
    }

    /// # Errors
    ///
    /// Returns `RepositoryNotFound` for unknown repositories.
    pub async fn get_embedding_status(
        &self,
        repository_id: &str,
    ) -> codelens_index::Result<EmbeddingStatus> {
        self.pipeline.get_status(repository_id).await
    }

    /// # Errors
    ///
    /// Returns `RepositoryNotFound` for unknown repositories.
    pub async fn get_processing_stats(
        &self,
        repository_id: &str,
    ) -> codelens_index::Result<ProcessingStats> {
        self.pipeline.get_stats(repository_id).await
    }

    /// # Errors
    ///
    /// Returns an error if the repository is unknown or a store fails.
    pub async fn remove_repository(&self, repository_id: &str) -> codelens_index::Result<usize> {
        self.pipeline.remove_repository(repository_id).await
    }

    /// # Errors
    ///
    /// Returns `InvalidLimit` or `Unavailable`.
    pub async fn vector_search(
        &self,
        repository_id: Option<&str>,
        query: &str,
        limit: usize,
    ) -> codelens_index::Result<Vec<SearchResult>> {
        self.retriever.vector_search(repository_id, query, limit).await
    }

    /// # Errors
    ///
    /// Returns `InvalidLimit` or `Unavailable`.
    pub async fn text_search(
        &self,
        repository_id: Option<&str>,
        query: &str,
        limit: usize,
    ) -> codelens_index::Result<Vec<SearchResult>> {
        self.retriever.text_search(repository_id, query, limit).await
    }

    /// # Errors
    ///
    /// Returns `InvalidLimit`, `InvalidWeight` or `Unavailable`.
    pub async fn hybrid_search(
        &self,
        repository_id: Option<&str>,
        query: &str,
        vector_weight: f32,
        limit: usize,
    ) -> codelens_index::Result<Vec<SearchResult>> {
        self.retriever
            .hybrid_search(repository_id, query, vector_weight, limit)
            .await
    }

    /// # Errors
    ///
    /// Returns `ChunkNotFound`, `InvalidLimit` or `Unavailable`.
    pub async fn find_similar_chunks(
        &self,
        chunk_id: &str,
        limit: usize,
    ) -> codelens_index::Result<Vec<SearchResult>> {
        self.retriever.find_similar(chunk_id, limit).await
    }

    /// # Errors
    ///
    /// See [`ChatOrchestrator::process_message`].
    pub async fn process_message(
        &self,
        session_id: &str,
        repository_id: Option<&str>,
        content: &str,
    ) -> Result<ChatSession, ChatError> {
        self.chat
            .process_message(session_id, repository_id, content)
            .await
    }

    /// # Errors
    ///
    /// See [`ChatOrchestrator::process_message_streaming`].
    pub async fn process_message_streaming(
        &self,
        session_id: &str,
        repository_id: Option<&str>,
        content: &str,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, ChatError> {
        self.chat
            .process_message_streaming(session_id, repository_id, content, cancel)
            .await
    }

    /// # Errors
    ///
    /// Returns [`ChatError::SessionNotFound`] for unknown sessions.
    pub async fn get_session(&self, session_id: &str) -> Result<ChatSession, ChatError> {
        self.chat.session(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use codelens_index::{EmbeddingState, IndexError};
    use codelens_llm::mock::MockProvider;
    use codelens_store::{InMemoryDocumentStore, InMemoryVectorStore};

    use super::*;

    fn service(config: &Config) -> CodeLens<MockProvider> {
        CodeLens::new(
            config,
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(MockProvider::default()),
        )
        .unwrap()
    }

    fn write_repo(dir: &tempfile::TempDir) {
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(
            dir.path().join("src/db.rs"),
            "pub fn connect_pool(url: &str) -> Pool {\n    Pool::open(url)\n}\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("src/http.rs"),
            "pub async fn serve(router: Router) {\n    listen(router).await;\n}\n",
        )
        .unwrap();
    }

    async fn wait_for_terminal(lens: &CodeLens<MockProvider>, repo: &str) -> EmbeddingStatus {
        for _ in 0..200 {
            let status = lens.get_embedding_status(repo).await.unwrap();
            if status.state.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("embedding of {repo} did not finish");
    }

    #[tokio::test]
    async fn import_queue_search_and_ask() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(&dir);
        let lens = service(&Config::default());
        lens.start();

        let report = lens
            .import_directory("demo", "demo", dir.path().to_path_buf())
            .await
            .unwrap();
        assert_eq!(report.files_imported, 2);

        assert_eq!(
            lens.queue_repository("demo", 0).await.unwrap(),
            QueueOutcome::Queued
        );
        let status = wait_for_terminal(&lens, "demo").await;
        assert_eq!(status.state, EmbeddingState::Completed);
        assert_eq!(status.total_chunks, 2);

        let hits = lens
            .hybrid_search(Some("demo"), "connect pool url", 0.7, 5)
            .await
            .unwrap();
        assert_eq!(hits[0].chunk.file_path, "src/db.rs");

        let similar = lens
            .find_similar_chunks(&hits[0].chunk.id, 5)
            .await
            .unwrap();
        assert!(similar.iter().all(|r| r.chunk.id != hits[0].chunk.id));

        let session = lens
            .process_message("s1", Some("demo"), "How is the pool connected?")
            .await
            .unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(lens.get_session("s1").await.unwrap(), session);

        let stats = lens.get_processing_stats("demo").await.unwrap();
        assert_eq!(stats.status.progress, 100);

        lens.shutdown().await;
        assert!(lens.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn unknown_repository_is_not_found() {
        let lens = service(&Config::default());
        let err = lens.get_embedding_status("missing").await.unwrap_err();
        assert!(matches!(err, IndexError::RepositoryNotFound(_)));
        assert!(lens.queue_repository("missing", 0).await.is_err());
        assert!(lens.get_session("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn remove_repository_clears_status() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(&dir);
        let lens = service(&Config::default());
        lens.import_directory("demo", "demo", dir.path().to_path_buf())
            .await
            .unwrap();
        lens.process_repository("demo").await.unwrap();

        assert_eq!(lens.remove_repository("demo").await.unwrap(), 2);
        assert!(lens.get_embedding_status("demo").await.is_err());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_shutdown_joins() {
        let mut config = Config::default();
        config.embedding.workers = 2;
        let lens = service(&config);
        lens.start();
        lens.start();
        assert_eq!(
            lens.workers.lock().unwrap_or_else(PoisonError::into_inner).len(),
            2
        );
        lens.shutdown().await;
        assert!(
            lens.workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
        );
    }

    #[test]
    fn invalid_pipeline_config_is_rejected() {
        let mut config = Config::default();
        config.embedding.workers = 0;
        let result = CodeLens::new(
            &config,
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(MockProvider::default()),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_chat_config_is_rejected() {
        let mut config = Config::default();
        config.chat.context_chunks = 0;
        let result = CodeLens::new(
            &config,
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(MockProvider::default()),
        );
        let Err(ConfigError::Invalid(msg)) = result else {
            panic!("expected invalid config");
        };
        assert!(msg.contains("chat.context_chunks"));
    }
}
