//! Retrieval-augmented chat over a repository.

pub mod prompt;
pub mod stream;

pub use prompt::{CHUNK_BOUNDARY, TRUNCATION_MARKER, build_prompt};
pub use stream::{ResponseStream, StreamChunk};

use std::sync::Arc;
use std::time::Duration;

use codelens_index::HybridRetriever;
use codelens_llm::{ChatStream, LlmProvider, Message, Role};
use codelens_store::{ChatMessage, ChatSession, ChunkRef, DocumentStore};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;
use prompt::SYSTEM_PROMPT;

/// Events buffered between the producer task and the consumer.
const STREAM_BUFFER: usize = 32;
const TITLE_CHARS: usize = 60;

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub context_chunks: usize,
    pub vector_weight: f32,
    /// Prompt budget in characters.
    pub max_prompt_length: usize,
    pub completion_timeout: Duration,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            context_chunks: 8,
            vector_weight: 0.7,
            max_prompt_length: 12_000,
            completion_timeout: Duration::from_secs(120),
        }
    }
}

/// Rough token estimate: four characters per token.
#[must_use]
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count() / 4).unwrap_or(u32::MAX)
}

fn session_title(content: &str) -> String {
    let first_line = content.lines().next().unwrap_or_default().trim();
    let mut title: String = first_line.chars().take(TITLE_CHARS).collect();
    if first_line.chars().count() > TITLE_CHARS {
        title.push('…');
    }
    title
}

/// Provider messages and context references for one turn.
struct PreparedTurn {
    messages: Vec<Message>,
    chunk_refs: Vec<ChunkRef>,
}

pub struct ChatOrchestrator<P> {
    documents: Arc<dyn DocumentStore>,
    retriever: Arc<HybridRetriever<P>>,
    provider: Arc<P>,
    settings: ChatSettings,
}

impl<P> std::fmt::Debug for ChatOrchestrator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatOrchestrator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<P: LlmProvider + 'static> ChatOrchestrator<P> {
    #[must_use]
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        retriever: Arc<HybridRetriever<P>>,
        provider: Arc<P>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            documents,
            retriever,
            provider,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    /// # Errors
    ///
    /// Returns [`ChatError::SessionNotFound`] if no session has this id.
    pub async fn session(&self, session_id: &str) -> Result<ChatSession, ChatError> {
        self.documents
            .session(session_id)
            .await?
            .ok_or_else(|| ChatError::SessionNotFound(session_id.to_owned()))
    }

    /// Answer `content` in one piece and return the updated session.
    ///
    /// The session is created on first use, bound to `repository_id`. A turn
    /// that fails after the question was stored still records one assistant
    /// message carrying the error.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is empty, retrieval fails, the
    /// provider fails or times out, or the store fails.
    pub async fn process_message(
        &self,
        session_id: &str,
        repository_id: Option<&str>,
        content: &str,
    ) -> Result<ChatSession, ChatError> {
        let question = validate_question(content)?;
        let repository = self.open_turn(session_id, repository_id, question).await?;
        let turn = match self.build_turn(session_id, repository.as_deref(), question).await {
            Ok(turn) => turn,
            Err(e) => return Err(self.record_failure(session_id, Vec::new(), e).await),
        };

        let timeout = self.settings.completion_timeout;
        let answer = match tokio::time::timeout(timeout, self.provider.chat(&turn.messages)).await
        {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                let err = ChatError::Completion(e);
                return Err(self.record_failure(session_id, turn.chunk_refs, err).await);
            }
            Err(_) => {
                let err = ChatError::CompletionTimeout {
                    seconds: timeout.as_secs(),
                };
                return Err(self.record_failure(session_id, turn.chunk_refs, err).await);
            }
        };

        let mut reply = ChatMessage::new(Role::Assistant, answer);
        reply.token_count = Some(estimate_tokens(&reply.content));
        reply.chunk_refs = turn.chunk_refs;
        self.documents.append_message(session_id, reply).await?;
        tracing::info!(session_id, "chat turn completed");

        self.session(session_id).await
    }

    /// Answer `content` as a stream of deltas.
    ///
    /// The assistant message is stored up front and rewritten after every
    /// delta. Firing `cancel` or dropping the stream stops generation and
    /// keeps the partial answer; no terminal event is sent in that case.
    ///
    /// # Errors
    ///
    /// Returns an error if the turn cannot be prepared. Failures after the
    /// stream starts arrive as [`StreamChunk::Error`].
    pub async fn process_message_streaming(
        &self,
        session_id: &str,
        repository_id: Option<&str>,
        content: &str,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, ChatError> {
        let question = validate_question(content)?;
        let cancel = cancel.child_token();
        if cancel.is_cancelled() {
            tracing::debug!(session_id, "chat cancelled before the turn started");
            return Ok(ResponseStream::closed(session_id.to_owned(), String::new(), cancel));
        }

        let repository = self.open_turn(session_id, repository_id, question).await?;
        let built = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            turn = self.build_turn(session_id, repository.as_deref(), question) => Some(turn),
        };
        let mut message = ChatMessage::new(Role::Assistant, "");
        let turn = match built {
            None => {
                self.documents
                    .append_message(session_id, message.clone())
                    .await?;
                tracing::debug!(session_id, "chat cancelled before generation started");
                return Ok(ResponseStream::closed(
                    session_id.to_owned(),
                    message.id,
                    cancel,
                ));
            }
            Some(Err(e)) => return Err(self.record_failure(session_id, Vec::new(), e).await),
            Some(Ok(turn)) => turn,
        };

        message.chunk_refs = turn.chunk_refs;
        self.documents
            .append_message(session_id, message.clone())
            .await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let message_id = message.id.clone();
        let producer = Producer {
            documents: Arc::clone(&self.documents),
            provider: Arc::clone(&self.provider),
            session_id: session_id.to_owned(),
            message,
            tx,
            cancel: cancel.clone(),
            timeout: self.settings.completion_timeout,
        };
        tokio::spawn(producer.run(turn.messages));

        Ok(ResponseStream::new(
            session_id.to_owned(),
            message_id,
            ReceiverStream::new(rx),
            cancel,
        ))
    }

    /// Load or create the session and store the user message.
    ///
    /// Returns the repository the session is bound to.
    async fn open_turn(
        &self,
        session_id: &str,
        repository_id: Option<&str>,
        question: &str,
    ) -> Result<Option<String>, ChatError> {
        let session = if let Some(session) = self.documents.session(session_id).await? {
            session
        } else {
            let session = ChatSession::new(
                session_id,
                repository_id.map(str::to_owned),
                session_title(question),
            );
            self.documents.create_session(session.clone()).await?;
            tracing::debug!(session_id, "chat session created");
            session
        };

        let mut message = ChatMessage::new(Role::User, question);
        message.token_count = Some(estimate_tokens(question));
        self.documents.append_message(session_id, message).await?;
        Ok(session.repository_id)
    }

    async fn build_turn(
        &self,
        session_id: &str,
        repository_id: Option<&str>,
        question: &str,
    ) -> Result<PreparedTurn, ChatError> {
        let results = match repository_id {
            Some(repo) => {
                self.retriever
                    .hybrid_search(
                        Some(repo),
                        question,
                        self.settings.vector_weight,
                        self.settings.context_chunks,
                    )
                    .await?
            }
            None => Vec::new(),
        };

        let prompt = build_prompt(question, &results, self.settings.max_prompt_length);
        tracing::debug!(
            session_id,
            context_chunks = results.len(),
            prompt_chars = prompt.chars().count(),
            "prompt built"
        );

        Ok(PreparedTurn {
            messages: vec![Message::system(SYSTEM_PROMPT), Message::user(prompt)],
            chunk_refs: results.iter().map(|r| r.chunk.to_ref(r.score)).collect(),
        })
    }

    /// Close a failed turn with an assistant message carrying `err`.
    async fn record_failure(
        &self,
        session_id: &str,
        chunk_refs: Vec<ChunkRef>,
        err: ChatError,
    ) -> ChatError {
        tracing::warn!(session_id, "chat turn failed: {err}");
        let mut reply = ChatMessage::new(Role::Assistant, "");
        reply.chunk_refs = chunk_refs;
        reply.error = Some(err.to_string());
        if let Err(e) = self.documents.append_message(session_id, reply).await {
            tracing::warn!(session_id, "failed to record chat failure: {e}");
        }
        err
    }
}

fn validate_question(content: &str) -> Result<&str, ChatError> {
    let question = content.trim();
    if question.is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    Ok(question)
}

/// Single producer feeding one [`ResponseStream`].
struct Producer<P> {
    documents: Arc<dyn DocumentStore>,
    provider: Arc<P>,
    session_id: String,
    message: ChatMessage,
    tx: mpsc::Sender<StreamChunk>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl<P: LlmProvider + 'static> Producer<P> {
    async fn run(mut self, messages: Vec<Message>) {
        let deadline = Instant::now() + self.timeout;

        let opened = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            () = self.tx.closed() => None,
            r = tokio::time::timeout_at(deadline, self.provider.chat_stream(&messages)) => Some(r),
        };
        let mut deltas: ChatStream = match opened {
            None => return self.stopped(),
            Some(Ok(Ok(stream))) => stream,
            Some(Ok(Err(e))) => return self.fail(ChatError::Completion(e)).await,
            Some(Err(_)) => return self.fail(self.timed_out()).await,
        };

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                () = self.tx.closed() => None,
                n = tokio::time::timeout_at(deadline, deltas.next()) => Some(n),
            };
            let delta = match next {
                None => return self.stopped(),
                Some(Err(_)) => return self.fail(self.timed_out()).await,
                Some(Ok(None)) => break,
                Some(Ok(Some(Err(e)))) => return self.fail(ChatError::Completion(e)).await,
                Some(Ok(Some(Ok(delta)))) => delta,
            };
            if delta.is_empty() {
                continue;
            }

            self.message.content.push_str(&delta);
            self.persist().await;
            let event = StreamChunk::Content {
                content: self.message.content.clone(),
                delta,
            };
            if !self.send(event).await {
                return self.stopped();
            }
        }

        self.message.token_count = Some(estimate_tokens(&self.message.content));
        self.persist().await;
        self.send(StreamChunk::Done).await;
        tracing::info!(session_id = %self.session_id, "chat stream completed");
    }

    fn timed_out(&self) -> ChatError {
        ChatError::CompletionTimeout {
            seconds: self.timeout.as_secs(),
        }
    }

    /// Returns `false` once the consumer is gone or the stream was cancelled.
    async fn send(&self, event: StreamChunk) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    async fn persist(&self) {
        if let Err(e) = self
            .documents
            .update_message(&self.session_id, self.message.clone())
            .await
        {
            tracing::warn!(
                session_id = %self.session_id,
                message_id = %self.message.id,
                "failed to persist assistant message: {e}"
            );
        }
    }

    fn stopped(&self) {
        tracing::info!(
            session_id = %self.session_id,
            chars = self.message.content.len(),
            "chat stream stopped early"
        );
    }

    async fn fail(&mut self, err: ChatError) {
        tracing::warn!(session_id = %self.session_id, "chat stream failed: {err}");
        self.message.error = Some(err.to_string());
        self.persist().await;
        self.send(StreamChunk::Error {
            content: err.to_string(),
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use codelens_index::{EmbeddingPipeline, PipelineConfig, RetrievalConfig, StatusTracker};
    use codelens_llm::mock::MockProvider;
    use codelens_store::{InMemoryDocumentStore, InMemoryVectorStore, Repository, SourceFile};

    use super::*;

    struct Fixture {
        chat: ChatOrchestrator<MockProvider>,
        documents: Arc<InMemoryDocumentStore>,
        provider: MockProvider,
    }

    async fn fixture(provider: MockProvider, settings: ChatSettings) -> Fixture {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let vectors = Arc::new(InMemoryVectorStore::new());
        let shared = Arc::new(provider.clone());

        documents
            .upsert_repository(Repository::new("r1", "demo"))
            .await
            .unwrap();
        documents
            .replace_files(
                "r1",
                vec![SourceFile {
                    repository_id: "r1".into(),
                    path: "src/pool.rs".into(),
                    language: "rust".into(),
                    content: "fn open_pool() {\n    connect database pool\n}\n".into(),
                }],
            )
            .await
            .unwrap();
        EmbeddingPipeline::new(
            documents.clone(),
            vectors.clone(),
            shared.clone(),
            Arc::new(StatusTracker::new(Duration::from_secs(60))),
            PipelineConfig::default(),
        )
        .unwrap()
        .process_repository("r1")
        .await
        .unwrap();

        let retriever = Arc::new(HybridRetriever::new(
            documents.clone(),
            vectors,
            shared.clone(),
            RetrievalConfig::default(),
        ));
        Fixture {
            chat: ChatOrchestrator::new(documents.clone(), retriever, shared, settings),
            documents,
            provider,
        }
    }

    async fn assistant_content(documents: &InMemoryDocumentStore, session_id: &str) -> String {
        let session = documents.session(session_id).await.unwrap().unwrap();
        session
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    #[test]
    fn title_is_first_line_capped() {
        assert_eq!(session_title("short question\nmore"), "short question");
        let long = "x".repeat(100);
        assert_eq!(session_title(&long).chars().count(), TITLE_CHARS + 1);
    }

    #[tokio::test]
    async fn sync_turn_appends_user_and_assistant() {
        let f = fixture(
            MockProvider::with_responses(vec!["It opens a pool.".into()]),
            ChatSettings::default(),
        )
        .await;

        let session = f
            .chat
            .process_message("s1", Some("r1"), "How is the database pool opened?")
            .await
            .unwrap();
        assert_eq!(session.repository_id.as_deref(), Some("r1"));
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[1].role, Role::Assistant);
        assert_eq!(session.messages[1].content, "It opens a pool.");
        assert!(!session.messages[1].chunk_refs.is_empty());
        assert_eq!(session.messages[1].chunk_refs[0].file_path, "src/pool.rs");

        let prompts = f.provider.prompts();
        let prompt = &prompts[0][1].content;
        assert!(prompt.contains("src/pool.rs (lines 1-3)"));
        assert!(prompt.contains("How is the database pool opened?"));
    }

    #[tokio::test]
    async fn session_without_repository_skips_retrieval() {
        let f = fixture(MockProvider::default(), ChatSettings::default()).await;
        let session = f.chat.process_message("s2", None, "hello").await.unwrap();
        assert!(session.messages[1].chunk_refs.is_empty());
        let prompts = f.provider.prompts();
        assert!(prompts[0][1].content.contains("No relevant code was found"));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let f = fixture(MockProvider::default(), ChatSettings::default()).await;
        assert!(matches!(
            f.chat.process_message("s1", None, "   ").await,
            Err(ChatError::EmptyMessage)
        ));
        assert!(f.chat.session("s1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn provider_failure_is_retryable() {
        let f = fixture(MockProvider::default(), ChatSettings::default()).await;
        let failing = ChatOrchestrator::new(
            f.documents.clone(),
            Arc::new(HybridRetriever::new(
                f.documents.clone(),
                Arc::new(InMemoryVectorStore::new()),
                Arc::new(MockProvider::failing()),
                RetrievalConfig::default(),
            )),
            Arc::new(MockProvider::failing()),
            ChatSettings::default(),
        );
        let err = failing.process_message("s3", None, "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::Completion(_)));
        assert!(err.is_retryable());

        let session = f.documents.session("s3").await.unwrap().unwrap();
        let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        let reply = &session.messages[1];
        assert!(reply.content.is_empty());
        assert!(reply.error.as_deref().unwrap().contains("mock LLM error"));
    }

    fn with_failing_retrieval(f: &Fixture) -> ChatOrchestrator<MockProvider> {
        ChatOrchestrator::new(
            f.documents.clone(),
            Arc::new(HybridRetriever::new(
                f.documents.clone(),
                Arc::new(InMemoryVectorStore::new()),
                Arc::new(MockProvider::failing()),
                RetrievalConfig::default(),
            )),
            Arc::new(f.provider.clone()),
            ChatSettings::default(),
        )
    }

    #[tokio::test]
    async fn retrieval_failure_closes_the_turn() {
        let f = fixture(MockProvider::default(), ChatSettings::default()).await;
        let chat = with_failing_retrieval(&f);

        let err = chat
            .process_message("s4", Some("r1"), "where is the pool?")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Retrieval(_)));

        let session = f.documents.session("s4").await.unwrap().unwrap();
        let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert!(session.messages[1].error.as_deref().unwrap().starts_with("retrieval failed"));
        assert!(f.provider.prompts().is_empty());
    }

    #[tokio::test]
    async fn streaming_retrieval_failure_closes_the_turn() {
        let f = fixture(MockProvider::default(), ChatSettings::default()).await;
        let chat = with_failing_retrieval(&f);

        let err = chat
            .process_message_streaming("s5", Some("r1"), "where?", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Retrieval(_)));

        let session = f.documents.session("s5").await.unwrap().unwrap();
        let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert!(session.messages[1].error.is_some());
    }

    #[tokio::test]
    async fn pre_cancelled_stream_stores_nothing() {
        let f = fixture(MockProvider::default(), ChatSettings::default()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stream = f
            .chat
            .process_message_streaming("s6", Some("r1"), "q", cancel)
            .await
            .unwrap();
        assert!(stream.next().await.is_none());
        assert!(f.documents.session("s6").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn streaming_delivers_deltas_then_done() {
        let f = fixture(
            MockProvider::with_responses(vec!["one two three".into()]),
            ChatSettings::default(),
        )
        .await;

        let stream = f
            .chat
            .process_message_streaming("s1", Some("r1"), "count", CancellationToken::new())
            .await
            .unwrap();
        let events: Vec<StreamChunk> = stream.collect().await;

        assert_eq!(events.last(), Some(&StreamChunk::Done));
        let deltas: String = events
            .iter()
            .filter_map(|e| match e {
                StreamChunk::Content { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, "one two three");
        assert!(matches!(
            &events[events.len() - 2],
            StreamChunk::Content { content, .. } if content == "one two three"
        ));

        let session = f.documents.session("s1").await.unwrap().unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(assistant_content(&f.documents, "s1").await, "one two three");
        assert!(session.messages[1].token_count.is_some());
    }

    #[tokio::test]
    async fn cancelling_keeps_partial_answer() {
        let f = fixture(
            MockProvider::with_responses(vec!["alpha beta gamma delta epsilon zeta".into()])
                .with_delta_delay(Duration::from_millis(30)),
            ChatSettings::default(),
        )
        .await;
        let cancel = CancellationToken::new();
        let mut stream = f
            .chat
            .process_message_streaming("s1", Some("r1"), "letters", cancel.clone())
            .await
            .unwrap();

        let first = stream.next().await.unwrap();
        assert!(matches!(first, StreamChunk::Content { ref delta, .. } if delta == "alpha "));
        cancel.cancel();
        assert!(stream.next().await.is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let partial = assistant_content(&f.documents, "s1").await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(assistant_content(&f.documents, "s1").await, partial);
        assert!(partial.starts_with("alpha"));
        assert_ne!(partial, "alpha beta gamma delta epsilon zeta");

        let session = f.documents.session("s1").await.unwrap().unwrap();
        assert_eq!(session.messages.len(), 2);
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_generation() {
        let f = fixture(
            MockProvider::with_responses(vec!["alpha beta gamma delta".into()])
                .with_delta_delay(Duration::from_millis(100)),
            ChatSettings::default(),
        )
        .await;
        let mut stream = f
            .chat
            .process_message_streaming("s1", Some("r1"), "letters", CancellationToken::new())
            .await
            .unwrap();

        let first = stream.next().await.unwrap();
        assert!(matches!(first, StreamChunk::Content { ref delta, .. } if delta == "alpha "));
        drop(stream);

        let at_drop = assistant_content(&f.documents, "s1").await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(at_drop, "alpha ");
        assert_eq!(assistant_content(&f.documents, "s1").await, "alpha ");
        assert_eq!(f.provider.cancelled_streams(), 1);
    }

    #[tokio::test]
    async fn stream_error_is_terminal_event() {
        let f = fixture(
            MockProvider::with_responses(vec!["a b c d".into()]).with_stream_error_after(2),
            ChatSettings::default(),
        )
        .await;
        let events: Vec<StreamChunk> = f
            .chat
            .process_message_streaming("s1", None, "q", CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events.last(), Some(StreamChunk::Error { .. })));
        assert_eq!(assistant_content(&f.documents, "s1").await, "a b ");
        let session = f.documents.session("s1").await.unwrap().unwrap();
        assert_eq!(session.messages.len(), 2);
        assert!(session.messages[1].error.is_some());
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let f = fixture(
            MockProvider::with_responses(vec!["x y z".into()])
                .with_delta_delay(Duration::from_millis(200)),
            ChatSettings {
                completion_timeout: Duration::from_millis(50),
                ..ChatSettings::default()
            },
        )
        .await;
        let events: Vec<StreamChunk> = f
            .chat
            .process_message_streaming("s1", None, "q", CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(
            events.as_slice(),
            [StreamChunk::Error { content }] if content.contains("timed out")
        ));
    }
}
