use crate::protocol::canonical::{ErrorDetails, ErrorKind};
use crate::transport::retry_after_from_headers;
use crate::util::{contains_ascii_case_insensitive, unix_now_secs};

/// Error type used across the pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream {
        status: u16,
        message: String,
        details: ErrorDetails,
    },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Stream disconnected: {0}")]
    Disconnect(String),
    #[error("Stream idle for {idle_ms}ms, connection dropped")]
    IdleTimeout { idle_ms: u64 },
    #[error("Provider error: {message}")]
    Provider {
        message: String,
        details: ErrorDetails,
    },
    #[error("Request was aborted")]
    Aborted,
}

impl StreamError {
    /// Machine-readable classification. `Aborted` carries none: callers
    /// switch on the stop reason for it.
    #[must_use]
    pub fn details(&self) -> Option<ErrorDetails> {
        match self {
            StreamError::Config(_) => {
                Some(ErrorDetails::new(ErrorKind::InvalidRequest).with_retryable(false))
            }
            StreamError::Auth(_) => Some(ErrorDetails::new(ErrorKind::Authentication)),
            StreamError::Upstream { details, .. } | StreamError::Provider { details, .. } => {
                Some(*details)
            }
            StreamError::Transport(_) => Some(ErrorDetails::new(ErrorKind::Transport)),
            StreamError::Disconnect(_) => Some(ErrorDetails::new(ErrorKind::StreamDisconnect)),
            StreamError::IdleTimeout { .. } => {
                Some(ErrorDetails::new(ErrorKind::StreamIdleTimeout))
            }
            StreamError::Aborted => None,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.details().is_some_and(|details| details.retryable)
    }

    #[must_use]
    pub fn retry_after_ms(&self) -> Option<u64> {
        self.details().and_then(|details| details.retry_after_ms)
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

const CONTEXT_LENGTH_NEEDLES: [&str; 9] = [
    "context_length_exceeded",
    "maximum context length",
    "context window",
    "prompt is too long",
    "input is too long",
    "too many input tokens",
    "exceeds the context",
    "input token count",
    "reduce the length of the messages",
];

/// Classify a backend error code (and message) independent of HTTP status.
///
/// Returns `None` when nothing in the code or message is recognised, so the
/// caller can fall back to a status- or context-specific default.
#[must_use]
pub fn classify_error_code(code: Option<&str>, message: &str) -> Option<ErrorKind> {
    let code = code.unwrap_or("");
    let mentions = |needle: &str| {
        contains_ascii_case_insensitive(code.as_bytes(), needle.as_bytes())
            || contains_ascii_case_insensitive(message.as_bytes(), needle.as_bytes())
    };

    if CONTEXT_LENGTH_NEEDLES.iter().any(|needle| mentions(needle)) {
        return Some(ErrorKind::ContextLengthExceeded);
    }
    if mentions("insufficient_quota") || mentions("exceeded your current quota") {
        return Some(ErrorKind::InsufficientQuota);
    }
    if mentions("usage_limit_reached") {
        return Some(ErrorKind::UsageLimitReached);
    }
    if mentions("usage_not_included") {
        return Some(ErrorKind::UsageNotIncluded);
    }

    let kind = match code {
        "rate_limit_exceeded" | "rate_limit_error" | "RESOURCE_EXHAUSTED" => ErrorKind::RateLimit,
        "overloaded_error" | "api_error" | "server_error" | "internal_error" | "server_is_overloaded"
        | "UNAVAILABLE" | "INTERNAL" => ErrorKind::ServerError,
        "authentication_error" | "permission_error" | "invalid_api_key" | "UNAUTHENTICATED"
        | "PERMISSION_DENIED" => ErrorKind::Authentication,
        "invalid_request_error" | "invalid_prompt" | "INVALID_ARGUMENT" => {
            ErrorKind::InvalidRequest
        }
        _ => return None,
    };
    Some(kind)
}

fn kind_for_status(status: u16) -> ErrorKind {
    match status {
        429 => ErrorKind::RateLimit,
        401 | 403 => ErrorKind::Authentication,
        500..=599 => ErrorKind::ServerError,
        _ => ErrorKind::InvalidRequest,
    }
}

struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
    resets_at: Option<u64>,
    resets_in_seconds: Option<u64>,
}

fn string_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_owned)
}

fn parse_error_body(body: &str) -> ErrorBody {
    let mut parsed = ErrorBody {
        code: None,
        message: None,
        resets_at: None,
        resets_in_seconds: None,
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return parsed;
    };
    // Gemini wraps errors in a one-element array.
    let value = match value {
        serde_json::Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };

    let error = match value.get("error") {
        Some(serde_json::Value::String(message)) => {
            parsed.message = Some(message.clone());
            &value
        }
        Some(inner @ serde_json::Value::Object(_)) => inner,
        _ => &value,
    };

    parsed.code = string_field(error, "code")
        .or_else(|| string_field(error, "type"))
        .or_else(|| string_field(error, "status"));
    if parsed.message.is_none() {
        parsed.message = string_field(error, "message").or_else(|| string_field(error, "detail"));
    }
    parsed.resets_at = error.get("resets_at").and_then(serde_json::Value::as_u64);
    parsed.resets_in_seconds = error
        .get("resets_in_seconds")
        .and_then(serde_json::Value::as_u64);
    parsed
}

/// Map a failed HTTP response to a classified [`StreamError::Upstream`].
///
/// Semantic classification from the body wins over the status code, so a
/// quota error served as 429 is still terminal.
#[must_use]
pub fn classify_http_error(status: u16, headers: &http::HeaderMap, body: &str) -> StreamError {
    let parsed = parse_error_body(body);
    let message = parsed
        .message
        .clone()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                format!("HTTP {status}")
            } else {
                trimmed.to_owned()
            }
        });

    let kind = classify_error_code(parsed.code.as_deref(), &message)
        .or_else(|| classify_error_code(None, body))
        .unwrap_or_else(|| kind_for_status(status));

    let mut retry_after_ms = retry_after_from_headers(headers)
        .map(|delay| u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
    if kind == ErrorKind::UsageLimitReached {
        let from_reset = parsed
            .resets_in_seconds
            .or_else(|| {
                parsed
                    .resets_at
                    .map(|at| at.saturating_sub(unix_now_secs()))
            })
            .map(|secs| secs.saturating_mul(1000));
        retry_after_ms = from_reset.or(retry_after_ms);
    }

    let message = match kind {
        ErrorKind::UsageLimitReached => match retry_after_ms {
            Some(ms) => format!(
                "{message} (usage limit resets in ~{} min)",
                ms.div_ceil(60_000)
            ),
            None => message,
        },
        _ => message,
    };

    StreamError::Upstream {
        status,
        message,
        details: ErrorDetails::new(kind).with_retry_after_ms(retry_after_ms),
    }
}

/// Classify an error reported inside an otherwise healthy stream.
#[must_use]
pub fn classify_stream_error(code: Option<&str>, message: &str) -> ErrorDetails {
    ErrorDetails::new(classify_error_code(code, message).unwrap_or(ErrorKind::ServerError))
}
