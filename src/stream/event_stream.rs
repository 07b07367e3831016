use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::stream::{BoxStream, Stream, StreamExt};

use crate::protocol::canonical::{AssistantMessage, StreamEvent};

/// The caller-facing sequence of [`StreamEvent`]s for one request.
///
/// Pull-driven: the upstream body is only read while the stream is polled,
/// so a slow consumer applies backpressure all the way to the socket.
/// Dropping the stream cancels the request and releases the connection.
/// Finite and not restartable.
pub struct AssistantMessageEventStream {
    inner: BoxStream<'static, StreamEvent>,
    /// The empty message until the terminal event, then its snapshot. Only
    /// the terminal snapshot is retained, so the engine can keep mutating
    /// its message in place while the caller drops intermediate events.
    last: Arc<AssistantMessage>,
    terminated: bool,
}

impl AssistantMessageEventStream {
    pub(crate) fn new(
        initial: Arc<AssistantMessage>,
        inner: BoxStream<'static, StreamEvent>,
    ) -> Self {
        Self {
            inner,
            last: initial,
            terminated: false,
        }
    }

    /// Whether the terminal `done`/`error` event has been yielded.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Drain the remaining events and resolve to the final message.
    pub async fn result(mut self) -> AssistantMessage {
        while self.next().await.is_some() {}
        Arc::unwrap_or_clone(self.last)
    }
}

impl Stream for AssistantMessageEventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.terminated {
            return Poll::Ready(None);
        }
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.last = Arc::clone(event.message());
                    self.terminated = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.terminated = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for AssistantMessageEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssistantMessageEventStream")
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}
