use super::canonical::{StopReason, UsagePatch};

// ---------------------------------------------------------------------------
// Stop reason mappings
// ---------------------------------------------------------------------------

#[must_use]
pub fn anthropic_stop_to_canonical(s: &str) -> StopReason {
    match s {
        "end_turn" | "stop_sequence" | "pause_turn" => StopReason::Stop,
        "max_tokens" | "model_context_window_exceeded" => StopReason::Length,
        "tool_use" => StopReason::ToolUse,
        _ => StopReason::Error, // refusal, sensitive, unknown
    }
}

#[must_use]
pub fn openai_stop_to_canonical(s: &str) -> StopReason {
    match s {
        "stop" | "end" => StopReason::Stop,
        "length" => StopReason::Length,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        _ => StopReason::Error, // content_filter, unknown
    }
}

/// `response.status` for the Responses family.
#[must_use]
pub fn responses_status_to_canonical(s: &str) -> StopReason {
    match s {
        "completed" | "in_progress" | "queued" => StopReason::Stop,
        "incomplete" => StopReason::Length,
        _ => StopReason::Error, // failed, cancelled
    }
}

#[must_use]
pub fn gemini_stop_to_canonical(s: &str) -> StopReason {
    match s {
        "STOP" | "FINISH_REASON_UNSPECIFIED" => StopReason::Stop,
        "MAX_TOKENS" => StopReason::Length,
        _ => StopReason::Error, // SAFETY, RECITATION, BLOCKLIST, MALFORMED_FUNCTION_CALL, ...
    }
}

// ---------------------------------------------------------------------------
// Usage mappings
// ---------------------------------------------------------------------------

/// Anthropic reports cache reads and writes separately from `input_tokens`.
#[must_use]
pub fn anthropic_usage(
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
) -> UsagePatch {
    UsagePatch {
        input: input_tokens,
        output: output_tokens,
        cache_read: cache_read_input_tokens,
        cache_write: cache_creation_input_tokens,
        total_tokens: None,
    }
}

/// For backends that count cached tokens inside the input figure: split them
/// out so `input` is only the uncached part.
#[must_use]
pub fn usage_with_cached_input(
    input_including_cached: u64,
    output: u64,
    cached: u64,
    total: Option<u64>,
) -> UsagePatch {
    let cached = cached.min(input_including_cached);
    UsagePatch {
        input: Some(input_including_cached - cached),
        output: Some(output),
        cache_read: Some(cached),
        cache_write: Some(0),
        total_tokens: total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_tables() {
        assert_eq!(anthropic_stop_to_canonical("end_turn"), StopReason::Stop);
        assert_eq!(anthropic_stop_to_canonical("tool_use"), StopReason::ToolUse);
        assert_eq!(anthropic_stop_to_canonical("refusal"), StopReason::Error);
        assert_eq!(openai_stop_to_canonical("length"), StopReason::Length);
        assert_eq!(openai_stop_to_canonical("content_filter"), StopReason::Error);
        assert_eq!(responses_status_to_canonical("incomplete"), StopReason::Length);
        assert_eq!(responses_status_to_canonical("failed"), StopReason::Error);
        assert_eq!(gemini_stop_to_canonical("MAX_TOKENS"), StopReason::Length);
        assert_eq!(gemini_stop_to_canonical("SAFETY"), StopReason::Error);
    }

    #[test]
    fn test_cached_tokens_subtracted_from_input() {
        let usage = usage_with_cached_input(100, 20, 40, None).into_usage();
        assert_eq!((usage.input, usage.cache_read, usage.output), (60, 40, 20));
        assert_eq!(usage.total_tokens, 120);
    }

    #[test]
    fn test_cached_never_exceeds_input() {
        let usage = usage_with_cached_input(10, 0, 50, Some(10)).into_usage();
        assert_eq!((usage.input, usage.cache_read), (0, 10));
    }
}
