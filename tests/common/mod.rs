#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use parking_lot::Mutex;
use unistream::config::{AppConfig, ProviderConfig};
use unistream::protocol::canonical::{Api, Model, StreamEvent};
use unistream::transport::{ByteStream, PreparedRequest, TransportResponse};
use unistream::{Client, RetryPolicy, StreamError, Transport};

/// One scripted upstream reply.
pub enum Reply {
    /// Status plus body chunks; `hang` keeps the body open after the last one.
    Body {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        chunks: Vec<Bytes>,
        hang: bool,
    },
    Fail(StreamError),
}

impl Reply {
    pub fn sse(body: &str) -> Self {
        Self::chunks(200, &[body])
    }

    pub fn chunks(status: u16, chunks: &[&str]) -> Self {
        Reply::Body {
            status,
            headers: Vec::new(),
            chunks: chunks
                .iter()
                .map(|chunk| Bytes::copy_from_slice(chunk.as_bytes()))
                .collect(),
            hang: false,
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self::chunks(status, &[body])
    }

    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        if let Reply::Body { headers, .. } = &mut self {
            headers.push((name, value));
        }
        self
    }

    pub fn hanging(mut self) -> Self {
        if let Reply::Body { hang, .. } = &mut self {
            *hang = true;
        }
        self
    }
}

/// In-memory transport replaying scripted replies in order.
#[derive(Default)]
pub struct FakeTransport {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<PreparedRequest>>,
}

impl FakeTransport {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<PreparedRequest> {
        self.requests.lock().clone()
    }
}

impl Transport for FakeTransport {
    fn send(&self, request: PreparedRequest) -> BoxFuture<'_, Result<TransportResponse, StreamError>> {
        self.requests.lock().push(request);
        let reply = self.replies.lock().pop_front();
        Box::pin(async move {
            match reply {
                None => Err(StreamError::Transport("no scripted reply".into())),
                Some(Reply::Fail(err)) => Err(err),
                Some(Reply::Body {
                    status,
                    headers,
                    chunks,
                    hang,
                }) => {
                    let mut map = http::HeaderMap::new();
                    for (name, value) in headers {
                        map.insert(name, http::HeaderValue::from_static(value));
                    }
                    let head = futures_util::stream::iter(chunks.into_iter().map(Ok));
                    let body: ByteStream = if hang {
                        head.chain(futures_util::stream::pending()).boxed()
                    } else {
                        head.boxed()
                    };
                    Ok(TransportResponse {
                        status,
                        headers: map,
                        body,
                    })
                }
            }
        })
    }
}

pub fn provider(name: &str, api: Api) -> ProviderConfig {
    ProviderConfig {
        name: name.to_owned(),
        api,
        base_url: format!("https://{name}.test/v1"),
        api_key: Some("test-key".to_owned()),
        api_key_env: None,
        api_version: None,
        headers: Default::default(),
    }
}

pub fn client(transport: Arc<FakeTransport>, providers: Vec<ProviderConfig>) -> Client {
    let config = AppConfig {
        providers,
        ..AppConfig::default()
    };
    Client::with_transport(config, transport)
}

pub fn model(api: Api, provider: &str) -> Model {
    Model::new("test-model", api, provider)
}

pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(50),
        jitter_ratio: 0.0,
    }
}

pub async fn collect(stream: unistream::AssistantMessageEventStream) -> Vec<StreamEvent> {
    stream.collect().await
}

pub fn kinds(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(StreamEvent::kind).collect()
}

/// Checks the lifecycle shape every stream must have: one `start` first,
/// one terminal event last, and each block's start matched by exactly one
/// end before the terminal event.
pub fn assert_well_formed(events: &[StreamEvent]) {
    assert_eq!(events.first().map(StreamEvent::kind), Some("start"));
    assert!(events.last().is_some_and(StreamEvent::is_terminal));
    assert_eq!(events.iter().filter(|e| e.kind() == "start").count(), 1);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let mut open: Option<usize> = None;
    let mut closed = Vec::new();
    for event in events {
        let Some(index) = event.content_index() else {
            continue;
        };
        match event.kind() {
            "text_start" | "thinking_start" | "toolcall_start" => {
                assert!(open.is_none(), "block opened while {open:?} still open");
                assert!(!closed.contains(&index), "index {index} reopened");
                open = Some(index);
            }
            "text_end" | "thinking_end" | "toolcall_end" => {
                assert_eq!(open, Some(index), "end without matching start");
                closed.push(index);
                open = None;
            }
            _ => assert_eq!(open, Some(index), "delta outside its block"),
        }
    }
    assert!(open.is_none(), "block {open:?} never closed");
}

/// Each delta extends the accumulated block content by exactly itself.
pub fn assert_monotonic_growth(events: &[StreamEvent]) {
    let mut accumulated: std::collections::HashMap<usize, String> = Default::default();
    for event in events {
        let (index, delta) = match event {
            StreamEvent::TextDelta {
                content_index,
                delta,
                ..
            }
            | StreamEvent::ThinkingDelta {
                content_index,
                delta,
                ..
            } => (*content_index, delta),
            _ => continue,
        };
        let so_far = accumulated.entry(index).or_default();
        so_far.push_str(delta);
        let block = &event.message().content[index];
        let current = block.as_text().or_else(|| block.as_thinking()).unwrap();
        assert_eq!(current, so_far.as_str());
    }
}
