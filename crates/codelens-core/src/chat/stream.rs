use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

/// One event of a streamed answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamChunk {
    /// `content` is the answer so far, `delta` the text added by this event.
    Content { content: String, delta: String },
    Done,
    Error { content: String },
}

impl StreamChunk {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

/// Answer stream returned by streaming chat.
///
/// Yields nothing once its cancellation token fires, even if events are
/// still buffered. Dropping it cancels the token, which stops the producer.
pub struct ResponseStream {
    session_id: String,
    message_id: String,
    inner: ReceiverStream<StreamChunk>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl ResponseStream {
    pub(crate) fn new(
        session_id: String,
        message_id: String,
        inner: ReceiverStream<StreamChunk>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            message_id,
            inner,
            _guard: cancel.clone().drop_guard(),
            cancel,
        }
    }

    /// A stream that ends immediately.
    pub(crate) fn closed(
        session_id: String,
        message_id: String,
        cancel: CancellationToken,
    ) -> Self {
        let (_, rx) = tokio::sync::mpsc::channel(1);
        Self::new(session_id, message_id, ReceiverStream::new(rx), cancel)
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Id of the assistant message being written.
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Stop generation. The partial answer stays persisted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("session_id", &self.session_id)
            .field("message_id", &self.message_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Stream for ResponseStream {
    type Item = StreamChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        Pin::new(&mut this.inner).poll_next(cx)
    }
}
