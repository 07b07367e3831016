pub mod engine;
pub mod event_stream;
pub(crate) mod pipeline;
pub mod sse;

pub use engine::{BlockEngine, BlockState, OpOutcome};
pub use event_stream::AssistantMessageEventStream;
pub use sse::{SseFramer, SseParser};

use crate::protocol::canonical::{ErrorDetails, StopReason, UsagePatch};
use serde_json::value::RawValue;

/// A parsed SSE frame from the upstream.
#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

/// One discrete protocol event after framing: the SSE event name (if the
/// backend sends one) and a payload already validated as JSON.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub event: Option<String>,
    pub data: Box<RawValue>,
}

impl RawFrame {
    /// Build a frame from a JSON string. Returns `None` for invalid JSON.
    #[must_use]
    pub fn from_json(event: Option<&str>, json: &str) -> Option<Self> {
        let data = RawValue::from_string(json.to_owned()).ok()?;
        Some(Self {
            event: event.map(str::to_owned),
            data,
        })
    }

    #[must_use]
    pub fn json(&self) -> &str {
        self.data.get()
    }
}

/// Primitive operations a decoder asks the [`BlockEngine`] to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOp {
    OpenText,
    /// Open a text block unless one is already current.
    EnsureText,
    AppendText(String),
    OpenThinking,
    /// Open a thinking block unless one is already current.
    EnsureThinking,
    /// A reasoning block the backend withheld; only the opaque payload is
    /// kept, for replay.
    OpenRedactedThinking {
        signature: String,
    },
    /// Append reasoning text; a signature fragment, if any, is appended to
    /// the block's signature.
    AppendThinking {
        delta: String,
        signature: Option<String>,
    },
    OpenToolCall {
        id: String,
        name: String,
        args: String,
    },
    AppendToolArgs(String),
    /// A tool call delivered in one piece.
    EmitCompleteToolCall {
        id: Option<String>,
        name: String,
        arguments: serde_json::Value,
        thought_signature: Option<String>,
    },
    /// Attach an opaque signature to the current block, replacing any
    /// previous one.
    SetSignature(String),
    CloseCurrent,
    SetUsage(UsagePatch),
    SetStopReason(StopReason),
    /// The backend reported an error inside the stream.
    Fail {
        details: Option<ErrorDetails>,
        message: String,
    },
}

/// Translates one backend's raw frames into engine operations.
///
/// Decoders never see engine state; they may keep small local bookkeeping
/// (an index map, a tag splitter) across frames of one stream.
pub trait StreamDecoder: Send {
    fn decode(&mut self, frame: &RawFrame, out: &mut Vec<EngineOp>);
}
