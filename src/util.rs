use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static TOOL_CALL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[inline]
pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

#[inline]
pub(crate) fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        })
}

/// Fresh tool-call id of the form `{name}_{unix_ms}_{counter}`.
///
/// Unique within the process; the timestamp only keeps ids from separate
/// runs apart, it is not a collision guarantee on its own.
pub(crate) fn synthesize_tool_call_id(name: &str) -> String {
    let counter = TOOL_CALL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let base = if name.is_empty() { "call" } else { name };
    format!("{base}_{}_{counter}", unix_now_millis())
}

#[inline]
pub(crate) fn contains_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }

    haystack
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesized_ids_are_unique_and_named() {
        let a = synthesize_tool_call_id("search");
        let b = synthesize_tool_call_id("search");
        assert_ne!(a, b);
        assert!(a.starts_with("search_"));
        assert!(synthesize_tool_call_id("").starts_with("call_"));
    }

    #[test]
    fn test_contains_ascii_case_insensitive() {
        assert!(contains_ascii_case_insensitive(b"Connection RESET by peer", b"connection reset"));
        assert!(!contains_ascii_case_insensitive(b"ok", b"longer needle"));
    }
}
