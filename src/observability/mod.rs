use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::protocol::canonical::{AssistantMessage, StopReason};

/// Initialize the tracing subscriber with the configured log level.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (TRACE, DEBUG, INFO, ERROR)
///
/// A subscriber installed earlier by the host application is left in place.
pub fn init_tracing(log_level: &str) {
    let Some(filter) = filter_for_level(log_level) else {
        return;
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

fn filter_for_level(log_level: &str) -> Option<EnvFilter> {
    let level = log_level.to_uppercase();
    let tracing_level = match level.as_str() {
        "DISABLED" => return None,
        "WARNING" => "WARN",
        "CRITICAL" => "ERROR",
        other => other,
    };
    Some(EnvFilter::try_new(tracing_level).unwrap_or_else(|_| EnvFilter::new("INFO")))
}

/// Log token usage and outcome once per finished stream.
pub fn log_stream_complete(message: &AssistantMessage, duration: Duration) {
    let usage = &message.usage;
    match message.stop_reason {
        StopReason::Error | StopReason::Aborted => tracing::warn!(
            api = %message.api,
            model = %message.model,
            stop_reason = message.stop_reason.as_str(),
            error_kind = message.error_details.map(|details| details.kind.as_str()),
            error = message.error_message.as_deref().unwrap_or(""),
            blocks = message.content.len(),
            duration_seconds = duration.as_secs_f64(),
            "stream failed"
        ),
        _ => tracing::info!(
            api = %message.api,
            model = %message.model,
            stop_reason = message.stop_reason.as_str(),
            input_tokens = usage.input,
            output_tokens = usage.output,
            cache_read_tokens = usage.cache_read,
            cache_write_tokens = usage.cache_write,
            total_tokens = usage.total_tokens,
            cost_total = usage.cost.total,
            duration_seconds = duration.as_secs_f64(),
            "stream completed"
        ),
    }
}
