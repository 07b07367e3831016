use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Wire protocol family a model is served over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Api {
    AnthropicMessages,
    OpenaiCompletions,
    OpenaiResponses,
    OpenaiCodexResponses,
    GoogleGenerativeAi,
    GoogleGeminiCli,
}

impl Api {
    pub const ALL: [Api; 6] = [
        Api::AnthropicMessages,
        Api::OpenaiCompletions,
        Api::OpenaiResponses,
        Api::OpenaiCodexResponses,
        Api::GoogleGenerativeAi,
        Api::GoogleGeminiCli,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Api::AnthropicMessages => "anthropic-messages",
            Api::OpenaiCompletions => "openai-completions",
            Api::OpenaiResponses => "openai-responses",
            Api::OpenaiCodexResponses => "openai-codex-responses",
            Api::GoogleGenerativeAi => "google-generative-ai",
            Api::GoogleGeminiCli => "google-gemini-cli",
        }
    }
}

impl fmt::Display for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Api {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Api::ALL
            .into_iter()
            .find(|api| api.as_str() == s)
            .ok_or_else(|| format!("unknown api '{s}'"))
    }
}

/// The model a request targets. Selection happens outside this crate; the
/// engine only needs identity, endpoint and capability flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    pub api: Api,
    pub provider: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub vision: bool,
}

impl Model {
    #[must_use]
    pub fn new(id: impl Into<String>, api: Api, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            api,
            provider: provider.into(),
            base_url: String::new(),
            vision: false,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn with_vision(mut self, vision: bool) -> Self {
        self.vision = vision;
        self
    }
}

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    #[default]
    Stop,
    Length,
    ToolUse,
    Error,
    Aborted,
}

impl StopReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Stop => "stop",
            StopReason::Length => "length",
            StopReason::ToolUse => "toolUse",
            StopReason::Error => "error",
            StopReason::Aborted => "aborted",
        }
    }
}

/// Monetary cost in currency units, same shape as the token counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
    pub total: f64,
}

/// Token accounting for one assistant message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub total_tokens: u64,
    pub cost: Cost,
}

/// Usage fields reported mid-stream. Backends report usage piecemeal
/// (Anthropic splits input and output across two events), so the engine
/// merges patches and writes [`Usage`] once at completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsagePatch {
    pub input: Option<u64>,
    pub output: Option<u64>,
    pub cache_read: Option<u64>,
    pub cache_write: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl UsagePatch {
    /// Later non-empty fields win.
    pub fn merge(&mut self, other: UsagePatch) {
        if other.input.is_some() {
            self.input = other.input;
        }
        if other.output.is_some() {
            self.output = other.output;
        }
        if other.cache_read.is_some() {
            self.cache_read = other.cache_read;
        }
        if other.cache_write.is_some() {
            self.cache_write = other.cache_write;
        }
        if other.total_tokens.is_some() {
            self.total_tokens = other.total_tokens;
        }
    }

    /// Materialize into a fully populated [`Usage`] (cost left at zero).
    #[must_use]
    pub fn into_usage(self) -> Usage {
        let input = self.input.unwrap_or(0);
        let output = self.output.unwrap_or(0);
        let cache_read = self.cache_read.unwrap_or(0);
        let cache_write = self.cache_write.unwrap_or(0);
        let total_tokens = self.total_tokens.unwrap_or_else(|| {
            input
                .saturating_add(output)
                .saturating_add(cache_read)
                .saturating_add(cache_write)
        });
        Usage {
            input,
            output,
            cache_read,
            cache_write,
            total_tokens,
            cost: Cost::default(),
        }
    }
}

/// Machine-readable classification of a failed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    ContextLengthExceeded,
    InsufficientQuota,
    UsageLimitReached,
    UsageNotIncluded,
    InvalidRequest,
    Authentication,
    ServerError,
    Transport,
    StreamDisconnect,
    StreamIdleTimeout,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ContextLengthExceeded => "context_length_exceeded",
            ErrorKind::InsufficientQuota => "insufficient_quota",
            ErrorKind::UsageLimitReached => "usage_limit_reached",
            ErrorKind::UsageNotIncluded => "usage_not_included",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Authentication => "authentication",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Transport => "transport",
            ErrorKind::StreamDisconnect => "stream_disconnect",
            ErrorKind::StreamIdleTimeout => "stream_idle_timeout",
        }
    }

    /// Default retryability for the kind, before any per-error override.
    #[must_use]
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::ServerError
                | ErrorKind::Transport
                | ErrorKind::StreamDisconnect
                | ErrorKind::StreamIdleTimeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub kind: ErrorKind,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorDetails {
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            retryable: kind.default_retryable(),
            retry_after_ms: None,
        }
    }

    #[must_use]
    pub fn with_retry_after_ms(mut self, retry_after_ms: Option<u64>) -> Self {
        self.retry_after_ms = retry_after_ms;
        self
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextContent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_signature: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingContent {
    pub thinking: String,
    /// Opaque continuation token, replayed verbatim to the originating backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_signature: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub redacted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

/// One unit of assistant output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentBlock {
    Text(TextContent),
    Thinking(ThinkingContent),
    ToolCall(ToolCall),
}

impl ContentBlock {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text(text) => Some(&text.text),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_thinking(&self) -> Option<&str> {
        match self {
            ContentBlock::Thinking(thinking) => Some(&thinking.thinking),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_tool_call(&self) -> Option<&ToolCall> {
        match self {
            ContentBlock::ToolCall(call) => Some(call),
            _ => None,
        }
    }
}

/// The assistant message under construction, and the final result of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub api: Api,
    pub provider: String,
    pub model: String,
    pub usage: Usage,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
    /// Creation time, unix milliseconds.
    pub timestamp: u64,
}

impl AssistantMessage {
    #[must_use]
    pub fn empty(model: &Model, timestamp: u64) -> Self {
        Self {
            content: Vec::new(),
            api: model.api,
            provider: model.provider.clone(),
            model: model.id.clone(),
            usage: Usage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
            error_details: None,
            timestamp,
        }
    }

    #[must_use]
    pub fn role(&self) -> &'static str {
        "assistant"
    }

    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolCall(_)))
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.content.iter().filter_map(ContentBlock::as_tool_call)
    }

    /// Concatenated text of all text blocks.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageContent {
    /// Base64 payload.
    pub data: String,
    pub mime_type: String,
}

/// Content allowed in user messages and tool results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UserContent {
    Text(TextContent),
    Image(ImageContent),
}

impl UserContent {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        UserContent::Text(TextContent {
            text: text.into(),
            text_signature: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub content: Vec<UserContent>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: Vec<UserContent>,
    #[serde(default)]
    pub is_error: bool,
    pub timestamp: u64,
}

/// A conversation history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
}

/// One canonical stream event.
///
/// Every event after `Start` carries an immutable snapshot of the message as
/// it stood right after the event was produced. Snapshots are copy-on-write:
/// the engine only clones the message when a caller still holds an older one.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start {
        partial: Arc<AssistantMessage>,
    },
    TextStart {
        content_index: usize,
        partial: Arc<AssistantMessage>,
    },
    TextDelta {
        content_index: usize,
        delta: String,
        partial: Arc<AssistantMessage>,
    },
    TextEnd {
        content_index: usize,
        content: String,
        partial: Arc<AssistantMessage>,
    },
    ThinkingStart {
        content_index: usize,
        partial: Arc<AssistantMessage>,
    },
    ThinkingDelta {
        content_index: usize,
        delta: String,
        partial: Arc<AssistantMessage>,
    },
    ThinkingEnd {
        content_index: usize,
        content: String,
        partial: Arc<AssistantMessage>,
    },
    ToolCallStart {
        content_index: usize,
        partial: Arc<AssistantMessage>,
    },
    ToolCallDelta {
        content_index: usize,
        delta: String,
        partial: Arc<AssistantMessage>,
    },
    ToolCallEnd {
        content_index: usize,
        tool_call: ToolCall,
        partial: Arc<AssistantMessage>,
    },
    Done {
        reason: StopReason,
        message: Arc<AssistantMessage>,
    },
    Error {
        reason: StopReason,
        error: Arc<AssistantMessage>,
    },
}

impl StreamEvent {
    /// Wire-style event name (`text_delta`, `toolcall_end`, ...).
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Start { .. } => "start",
            StreamEvent::TextStart { .. } => "text_start",
            StreamEvent::TextDelta { .. } => "text_delta",
            StreamEvent::TextEnd { .. } => "text_end",
            StreamEvent::ThinkingStart { .. } => "thinking_start",
            StreamEvent::ThinkingDelta { .. } => "thinking_delta",
            StreamEvent::ThinkingEnd { .. } => "thinking_end",
            StreamEvent::ToolCallStart { .. } => "toolcall_start",
            StreamEvent::ToolCallDelta { .. } => "toolcall_delta",
            StreamEvent::ToolCallEnd { .. } => "toolcall_end",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// The message snapshot this event describes.
    #[must_use]
    pub fn message(&self) -> &Arc<AssistantMessage> {
        match self {
            StreamEvent::Start { partial }
            | StreamEvent::TextStart { partial, .. }
            | StreamEvent::TextDelta { partial, .. }
            | StreamEvent::TextEnd { partial, .. }
            | StreamEvent::ThinkingStart { partial, .. }
            | StreamEvent::ThinkingDelta { partial, .. }
            | StreamEvent::ThinkingEnd { partial, .. }
            | StreamEvent::ToolCallStart { partial, .. }
            | StreamEvent::ToolCallDelta { partial, .. }
            | StreamEvent::ToolCallEnd { partial, .. } => partial,
            StreamEvent::Done { message, .. } => message,
            StreamEvent::Error { error, .. } => error,
        }
    }

    #[must_use]
    pub fn content_index(&self) -> Option<usize> {
        match self {
            StreamEvent::TextStart { content_index, .. }
            | StreamEvent::TextDelta { content_index, .. }
            | StreamEvent::TextEnd { content_index, .. }
            | StreamEvent::ThinkingStart { content_index, .. }
            | StreamEvent::ThinkingDelta { content_index, .. }
            | StreamEvent::ThinkingEnd { content_index, .. }
            | StreamEvent::ToolCallStart { content_index, .. }
            | StreamEvent::ToolCallDelta { content_index, .. }
            | StreamEvent::ToolCallEnd { content_index, .. } => Some(*content_index),
            StreamEvent::Start { .. } | StreamEvent::Done { .. } | StreamEvent::Error { .. } => {
                None
            }
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}
