//! Deterministic in-process provider for tests.
//!
//! Embeddings are hashed bag-of-words vectors, so texts sharing words land
//! close together under cosine similarity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_stream::wrappers::ReceiverStream;

use crate::error::LlmError;
use crate::provider::{ChatStream, LlmProvider, Message};

#[derive(Debug, Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<VecDeque<String>>>,
    prompts: Arc<Mutex<Vec<Vec<Message>>>>,
    embed_calls: Arc<AtomicUsize>,
    embedded_texts: Arc<AtomicUsize>,
    cancelled_streams: Arc<AtomicUsize>,
    pub default_response: String,
    pub dimensions: usize,
    pub fail_chat: bool,
    pub fail_embed: bool,
    /// Fail any embedding batch containing a text with this substring.
    pub fail_embed_on: Option<String>,
    /// Yield an error after this many stream deltas.
    pub stream_error_after: Option<usize>,
    /// Sleep between streamed deltas.
    pub delta_delay: Duration,
    /// Sleep before answering an embedding batch.
    pub embed_delay: Duration,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            prompts: Arc::new(Mutex::new(Vec::new())),
            embed_calls: Arc::new(AtomicUsize::new(0)),
            embedded_texts: Arc::new(AtomicUsize::new(0)),
            cancelled_streams: Arc::new(AtomicUsize::new(0)),
            default_response: "mock response".into(),
            dimensions: 64,
            fail_chat: false,
            fail_embed: false,
            fail_embed_on: None,
            stream_error_after: None,
            delta_delay: Duration::ZERO,
            embed_delay: Duration::ZERO,
        }
    }
}

impl MockProvider {
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_chat: true,
            fail_embed: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    #[must_use]
    pub fn with_delta_delay(mut self, delay: Duration) -> Self {
        self.delta_delay = delay;
        self
    }

    #[must_use]
    pub fn with_embed_delay(mut self, delay: Duration) -> Self {
        self.embed_delay = delay;
        self
    }

    #[must_use]
    pub fn fail_embed_on(mut self, needle: impl Into<String>) -> Self {
        self.fail_embed_on = Some(needle.into());
        self
    }

    #[must_use]
    pub fn with_stream_error_after(mut self, deltas: usize) -> Self {
        self.stream_error_after = Some(deltas);
        self
    }

    /// Number of `embed_batch` calls made so far, across clones.
    #[must_use]
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    /// Number of texts embedded successfully so far, across clones.
    #[must_use]
    pub fn embedded_texts(&self) -> usize {
        self.embedded_texts.load(Ordering::SeqCst)
    }

    /// Streams whose consumer went away before all deltas were delivered.
    #[must_use]
    pub fn cancelled_streams(&self) -> usize {
        self.cancelled_streams.load(Ordering::SeqCst)
    }

    /// Every message list passed to `chat` or `chat_stream`, oldest first.
    #[must_use]
    pub fn prompts(&self) -> Vec<Vec<Message>> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_response(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(messages.to_vec());
        if self.fail_chat {
            return Err(LlmError::Other("mock LLM error".into()));
        }
        let mut responses = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(responses
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone()))
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0_f32; self.dimensions.max(1)];
        let len = v.len();
        for token in text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
        {
            let bucket = fnv1a(&token.to_lowercase()) % len as u64;
            let idx = usize::try_from(bucket).unwrap_or_default();
            v[idx] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        } else {
            v[0] = 1.0;
        }
        v
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

impl LlmProvider for MockProvider {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.next_response(messages)
    }

    async fn chat_stream(&self, messages: &[Message]) -> Result<ChatStream, LlmError> {
        let response = self.next_response(messages)?;
        let deltas: Vec<String> = response
            .split_inclusive(' ')
            .map(str::to_owned)
            .collect();
        let delay = self.delta_delay;
        let error_after = self.stream_error_after;
        let cancelled = Arc::clone(&self.cancelled_streams);

        let (tx, rx) = tokio::sync::mpsc::channel(1);
        tokio::spawn(async move {
            for (i, delta) in deltas.into_iter().enumerate() {
                if error_after == Some(i) {
                    let _ = tx
                        .send(Err(LlmError::SseParse("mock stream failure".into())))
                        .await;
                    return;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(delta)).await.is_err() {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                    return;
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if !self.embed_delay.is_zero() {
            tokio::time::sleep(self.embed_delay).await;
        }
        if self.fail_embed {
            return Err(LlmError::Unavailable);
        }
        if let Some(needle) = &self.fail_embed_on
            && texts.iter().any(|t| t.contains(needle.as_str()))
        {
            return Err(LlmError::Other(format!("mock embed failure on {needle:?}")));
        }
        self.embedded_texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn embeddings_are_deterministic_and_normalized() {
        let p = MockProvider::default();
        let a = p.embed("fn parse_config").await.unwrap();
        let b = p.embed("fn parse_config").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-5);
        assert_eq!(p.embed_calls(), 2);
    }

    #[tokio::test]
    async fn shared_words_score_higher() {
        let p = MockProvider::default();
        let q = p.embed("database connection pool").await.unwrap();
        let near = p.embed("open database connection").await.unwrap();
        let far = p.embed("render html template").await.unwrap();
        assert!(cosine(&q, &near) > cosine(&q, &far));
    }

    #[tokio::test]
    async fn fail_embed_on_rejects_whole_batch() {
        let p = MockProvider::default().fail_embed_on("poison");
        let err = p
            .embed_batch(&["ok".into(), "poison pill".into()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("poison"));
        assert_eq!(p.embedded_texts(), 0);
    }

    #[tokio::test]
    async fn responses_are_consumed_in_order() {
        let p = MockProvider::with_responses(vec!["one".into(), "two".into()]);
        assert_eq!(p.chat(&[]).await.unwrap(), "one");
        assert_eq!(p.chat(&[]).await.unwrap(), "two");
        assert_eq!(p.chat(&[]).await.unwrap(), "mock response");
        assert_eq!(p.prompts().len(), 3);
    }

    #[tokio::test]
    async fn stream_splits_on_words() {
        let p = MockProvider::with_responses(vec!["a b c".into()]);
        let stream = p.chat_stream(&[Message::user("q")]).await.unwrap();
        let parts: Vec<String> = stream.map(Result::unwrap).collect().await;
        assert_eq!(parts, vec!["a ", "b ", "c"]);
    }

    #[tokio::test]
    async fn stream_error_after_yields_error() {
        let p = MockProvider::with_responses(vec!["a b c".into()]).with_stream_error_after(1);
        let items: Vec<_> = p.chat_stream(&[]).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }
}
