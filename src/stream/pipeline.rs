//! Per-request driver: connect with retry, frame, decode, apply.
//!
//! The pipeline is a pull-driven state machine behind
//! [`futures_util::stream::unfold`]; nothing is read from the network unless
//! the caller polls. Each step either queues events or changes phase, and the
//! engine's terminal event ends the stream.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::engine::{BlockEngine, OpOutcome};
use super::event_stream::AssistantMessageEventStream;
use super::sse::SseFramer;
use super::{EngineOp, RawFrame, StreamDecoder};
use crate::cost::CostCalculator;
use crate::error::{classify_http_error, StreamError};
use crate::observability::log_stream_complete;
use crate::protocol::canonical::{Api, Model, StopReason, StreamEvent};
use crate::protocol::decoder_for;
use crate::transport::{
    ByteStream, PreparedRequest, RetryDecision, RetryPolicy, Transport, TransportResponse,
};

const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// Everything one request needs, resolved by the client.
pub(crate) struct PipelineSetup {
    pub model: Model,
    pub request: PreparedRequest,
    pub transport: Arc<dyn Transport>,
    pub cost: Arc<dyn CostCalculator>,
    pub retry: RetryPolicy,
    pub idle_timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

enum Phase {
    Start,
    Connect { attempt: u32 },
    Streaming { body: ByteStream, attempt: u32 },
    /// The body has ended; buffered frames are still being applied.
    Draining { attempt: u32 },
    Done,
}

struct Pipeline {
    api: Api,
    request: PreparedRequest,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    idle_timeout: Option<Duration>,
    cancel: CancellationToken,
    engine: BlockEngine,
    framer: SseFramer,
    decoder: Box<dyn StreamDecoder>,
    phase: Phase,
    pending: VecDeque<StreamEvent>,
    events: Vec<StreamEvent>,
    /// Decoded but not yet applied. Frames are applied one at a time so the
    /// caller has released the previous snapshot before the engine mutates.
    frames: VecDeque<RawFrame>,
    framed: Vec<RawFrame>,
    ops: Vec<EngineOp>,
    started_at: Instant,
    span: tracing::Span,
}

fn idle_ms(limit: Duration) -> u64 {
    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX)
}

/// Bound `fut` by the idle timeout, if any.
async fn within_idle<F, T>(idle_timeout: Option<Duration>, fut: F) -> Result<T, StreamError>
where
    F: Future<Output = Result<T, StreamError>>,
{
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::IdleTimeout {
                idle_ms: idle_ms(limit),
            }),
        },
        None => fut.await,
    }
}

async fn read_error_body(body: &mut ByteStream) -> Result<String, StreamError> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.next().await {
        let Ok(chunk) = chunk else {
            break;
        };
        let room = ERROR_BODY_LIMIT.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if buf.len() >= ERROR_BODY_LIMIT {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn new_span(model: &Model) -> tracing::Span {
    tracing::info_span!(
        "stream",
        request_id = %uuid::Uuid::new_v4(),
        api = %model.api,
        provider = %model.provider,
        model = %model.id,
    )
}

impl Pipeline {
    fn new(setup: PipelineSetup) -> Self {
        let api = setup.model.api;
        let span = new_span(&setup.model);
        Self {
            api,
            request: setup.request,
            transport: setup.transport,
            retry: setup.retry,
            idle_timeout: setup.idle_timeout,
            cancel: setup.cancel,
            engine: BlockEngine::new(&setup.model).with_cost_calculator(setup.cost),
            framer: SseFramer::new(),
            decoder: decoder_for(api),
            phase: Phase::Start,
            pending: VecDeque::with_capacity(8),
            events: Vec::with_capacity(8),
            frames: VecDeque::with_capacity(8),
            framed: Vec::with_capacity(8),
            ops: Vec::with_capacity(8),
            started_at: Instant::now(),
            span,
        }
    }

    async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Done => return None,
                Phase::Start => {
                    self.engine.start(&mut self.events);
                    self.phase = Phase::Connect { attempt: 0 };
                }
                Phase::Connect { attempt } => self.connect(attempt).await,
                Phase::Streaming { body, attempt } => {
                    if self.frames.is_empty() {
                        self.read(body, attempt).await;
                    } else {
                        self.step(Phase::Streaming { body, attempt }, attempt).await;
                    }
                }
                Phase::Draining { attempt } => {
                    if self.frames.is_empty() {
                        self.end_of_body(attempt).await;
                    } else {
                        self.step(Phase::Draining { attempt }, attempt).await;
                    }
                }
            }
            self.pending.extend(self.events.drain(..));
            if self.engine.is_finished() {
                self.phase = Phase::Done;
                if self.framer.discarded() > 0 {
                    tracing::debug!(discarded = self.framer.discarded(), "malformed frames skipped");
                }
                log_stream_complete(self.engine.message(), self.started_at.elapsed());
            }
        }
    }

    async fn connect(&mut self, attempt: u32) {
        tracing::debug!(attempt, url = %self.request.url, "connecting upstream");
        let send = self.transport.send(self.request.clone());
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(StreamError::Aborted),
            result = within_idle(self.idle_timeout, send) => result,
        };
        let response = match result {
            Ok(response) => response,
            Err(err) => return self.handle_error(err, attempt).await,
        };
        if response.is_success() {
            self.phase = Phase::Streaming {
                body: response.body,
                attempt,
            };
            return;
        }

        let TransportResponse {
            status,
            headers,
            mut body,
        } = response;
        let read = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(StreamError::Aborted),
            read = within_idle(self.idle_timeout, read_error_body(&mut body)) => read,
        };
        drop(body);
        let err = match read {
            Ok(text) => classify_http_error(status, &headers, &text),
            Err(StreamError::Aborted) => StreamError::Aborted,
            Err(err) => {
                tracing::debug!(status, error = %err, "error body unreadable, classifying by status");
                classify_http_error(status, &headers, "")
            }
        };
        self.handle_error(err, attempt).await;
    }

    async fn read(&mut self, mut body: ByteStream, attempt: u32) {
        let chunk = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(StreamError::Aborted),
            chunk = within_idle(self.idle_timeout, async { body.next().await.transpose() }) => chunk,
        };
        match chunk {
            Ok(Some(bytes)) => {
                self.framer.push_bytes(&bytes, &mut self.framed);
                self.frames.extend(self.framed.drain(..));
                self.phase = Phase::Streaming { body, attempt };
            }
            Ok(None) => {
                drop(body);
                self.framer.finish(&mut self.framed);
                self.frames.extend(self.framed.drain(..));
                self.phase = Phase::Draining { attempt };
            }
            Err(err) => {
                drop(body);
                self.handle_error(err, attempt).await;
            }
        }
    }

    /// Apply the next buffered frame, then resume `resume` unless the stream
    /// ended or failed.
    async fn step(&mut self, resume: Phase, attempt: u32) {
        let Some(frame) = self.frames.pop_front() else {
            self.phase = resume;
            return;
        };
        match self.apply_frame(&frame) {
            Ok(()) => {
                if !self.engine.is_finished() {
                    self.phase = resume;
                }
            }
            Err(err) => {
                drop(resume);
                self.handle_error(err, attempt).await;
            }
        }
    }

    /// The body ended and every frame has been applied. `[DONE]` counts as a
    /// clean end even without a stop reason.
    async fn end_of_body(&mut self, attempt: u32) {
        if self.engine.is_finished() {
            return;
        }
        if self.engine.has_stop_reason() || self.framer.saw_done() {
            self.engine.finish(&mut self.events);
        } else {
            let err = StreamError::Disconnect("stream ended before a stop reason".to_owned());
            self.handle_error(err, attempt).await;
        }
    }

    /// Decode one frame and apply the resulting operations. A failure the
    /// backend classified is returned for the retry decision; an
    /// unclassified one ends the stream here.
    fn apply_frame(&mut self, frame: &RawFrame) -> Result<(), StreamError> {
        self.decoder.decode(frame, &mut self.ops);
        for op in self.ops.drain(..) {
            match self.engine.apply(op, &mut self.events) {
                OpOutcome::Continue => {}
                OpOutcome::Failed {
                    details: Some(details),
                    message,
                } => return Err(StreamError::Provider { message, details }),
                OpOutcome::Failed {
                    details: None,
                    message,
                } => {
                    self.engine
                        .fail(StopReason::Error, None, message, &mut self.events);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn handle_error(&mut self, err: StreamError, attempt: u32) {
        self.frames.clear();
        self.framed.clear();
        self.ops.clear();
        if matches!(err, StreamError::Aborted) {
            tracing::info!(attempt, "request aborted");
            return self.abort();
        }
        if !self.engine.has_emitted_content() && err.is_retryable() {
            let retry_after = err.retry_after_ms().map(Duration::from_millis);
            if let RetryDecision::RetryAfter(delay) = self.retry.decide(attempt, retry_after) {
                tracing::warn!(
                    attempt = attempt + 1,
                    max_retries = self.retry.max_retries,
                    delay_ms = idle_ms(delay),
                    error = %err,
                    "retrying upstream request"
                );
                let slept = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => false,
                    () = tokio::time::sleep(delay) => true,
                };
                if !slept {
                    return self.abort();
                }
                self.engine.reset_attempt();
                self.framer = SseFramer::new();
                self.decoder = decoder_for(self.api);
                self.phase = Phase::Connect {
                    attempt: attempt + 1,
                };
                return;
            }
        }

        if let StreamError::IdleTimeout { idle_ms } = err {
            tracing::warn!(idle_ms, "upstream went idle");
        }
        let message = match &err {
            StreamError::Upstream { message, .. } | StreamError::Provider { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        };
        self.engine
            .fail(StopReason::Error, err.details(), message, &mut self.events);
    }

    fn abort(&mut self) {
        self.engine.fail(
            StopReason::Aborted,
            None,
            StreamError::Aborted.to_string(),
            &mut self.events,
        );
    }
}

/// Start streaming one request.
pub(crate) fn run(setup: PipelineSetup) -> AssistantMessageEventStream {
    let pipeline = Pipeline::new(setup);
    let initial = Arc::new(pipeline.engine.message().clone());
    let inner = futures_util::stream::unfold(pipeline, |mut pipeline| async move {
        let span = pipeline.span.clone();
        let event = pipeline.next_event().instrument(span).await?;
        Some((event, pipeline))
    })
    .boxed();
    AssistantMessageEventStream::new(initial, inner)
}

/// A request that failed before any I/O: `start` followed by the error.
pub(crate) fn rejected(
    model: &Model,
    cost: Arc<dyn CostCalculator>,
    err: &StreamError,
) -> AssistantMessageEventStream {
    let span = new_span(model);
    let _entered = span.enter();
    let mut engine = BlockEngine::new(model).with_cost_calculator(cost);
    let initial = Arc::new(engine.message().clone());
    let mut events = Vec::with_capacity(2);
    engine.start(&mut events);
    let reason = if matches!(err, StreamError::Aborted) {
        StopReason::Aborted
    } else {
        StopReason::Error
    };
    engine.fail(reason, err.details(), err.to_string(), &mut events);
    log_stream_complete(engine.message(), Duration::ZERO);
    AssistantMessageEventStream::new(initial, futures_util::stream::iter(events).boxed())
}
