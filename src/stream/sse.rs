//! SSE (Server-Sent Events) framing.
//!
//! [`SseParser`] handles line buffering and field semantics per the
//! [SSE specification](https://html.spec.whatwg.org/multipage/server-sent-events.html).
//! [`SseFramer`] sits on top of it: it accepts raw bytes split at arbitrary
//! boundaries (including inside multi-byte UTF-8 sequences), notes and drops
//! `[DONE]` sentinels, drops frames whose payload is not JSON, and yields
//! [`RawFrame`]s.
use super::{RawFrame, SseEvent};
use memchr::memchr_iter;

// ---------------------------------------------------------------------------
// SseParser: incremental SSE line parser
// ---------------------------------------------------------------------------

/// Incremental SSE line parser.
///
/// Feed it raw text chunks (potentially arriving in arbitrary byte
/// boundaries) and it yields fully-assembled [`SseEvent`] frames.
pub struct SseParser {
    buffer: String,
    read_offset: usize,
    state: FrameState,
}

#[derive(Default)]
struct FrameState {
    event_type: Option<String>,
    data_buffer: String,
    has_data: bool,
    last_event_id: Option<String>,
    retry: Option<u64>,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            read_offset: 0,
            state: FrameState::default(),
        }
    }

    /// Feed raw text and return any complete events parsed.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed raw text and append complete events into a caller-provided buffer.
    ///
    /// - `event:` sets the event type for the next frame
    /// - `data:` appends to the data buffer (one leading space stripped);
    ///   multiple `data:` lines are joined with `\n`
    /// - an empty line terminates the frame
    /// - `:` starts a comment; unknown fields are ignored
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<SseEvent>) {
        self.buffer.push_str(chunk);
        let mut processed_up_to = self.read_offset;
        let bytes = self.buffer.as_bytes();
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &bytes[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let mut line = &self.buffer[processed_up_to..line_end];
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            self.state.process_line(line, out);
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Flush a trailing frame that was never terminated by a blank line.
    pub fn finish_into(&mut self, out: &mut Vec<SseEvent>) {
        if self.read_offset < self.buffer.len() {
            let tail = &self.buffer[self.read_offset..];
            let tail = tail.strip_suffix('\r').unwrap_or(tail);
            self.state.process_line(tail, out);
        }
        self.buffer.clear();
        self.read_offset = 0;
        self.state.dispatch(out);
    }
}

impl FrameState {
    fn dispatch(&mut self, out: &mut Vec<SseEvent>) {
        if self.has_data {
            out.push(SseEvent {
                event: self.event_type.take(),
                data: std::mem::take(&mut self.data_buffer),
                id: self.last_event_id.clone(),
                retry: self.retry,
            });
            self.has_data = false;
        } else {
            self.event_type = None;
        }
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.dispatch(out);
            return;
        }

        if line.starts_with(':') {
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            if self.has_data {
                self.data_buffer.push('\n');
            } else {
                self.has_data = true;
            }
            self.data_buffer.push_str(value);
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.event_type = Some(value.to_owned());
        } else if let Some(value) = line.strip_prefix("id:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.last_event_id = Some(value.to_owned());
        } else if let Some(value) = line.strip_prefix("retry:") {
            if let Ok(ms) = value.trim().parse::<u64>() {
                self.retry = Some(ms);
            }
        }
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if an [`SseEvent`] is a terminal `[DONE]` sentinel.
#[must_use]
pub fn is_done_event(event: &SseEvent) -> bool {
    event.data.trim() == "[DONE]"
}

// ---------------------------------------------------------------------------
// SseFramer: bytes in, JSON frames out
// ---------------------------------------------------------------------------

/// Turns raw body bytes into [`RawFrame`]s.
///
/// Malformed frames are expected (comments, keep-alives, truncated garbage)
/// and are discarded without failing the stream.
#[derive(Default)]
pub struct SseFramer {
    parser: SseParser,
    remainder: Vec<u8>,
    parsed: Vec<SseEvent>,
    discarded: u64,
    saw_done: bool,
}

impl SseFramer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames dropped so far because their payload was not JSON.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Whether the `[DONE]` sentinel has been seen.
    #[must_use]
    pub fn saw_done(&self) -> bool {
        self.saw_done
    }

    /// Feed one body chunk, appending complete frames to `out`.
    pub fn push_bytes(&mut self, bytes: &[u8], out: &mut Vec<RawFrame>) {
        if self.remainder.is_empty() {
            self.feed_utf8(bytes);
        } else {
            let mut pending = std::mem::take(&mut self.remainder);
            pending.extend_from_slice(bytes);
            self.feed_utf8(&pending);
        }
        self.drain_parsed(out);
    }

    /// Flush whatever is buffered once the body has ended.
    pub fn finish(&mut self, out: &mut Vec<RawFrame>) {
        if !self.remainder.is_empty() {
            let tail = std::mem::take(&mut self.remainder);
            self.parser
                .feed_into(&String::from_utf8_lossy(&tail), &mut self.parsed);
        }
        self.parser.finish_into(&mut self.parsed);
        self.drain_parsed(out);
    }

    fn feed_utf8(&mut self, bytes: &[u8]) {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.parser.feed_into(text, &mut self.parsed),
            Err(e) => {
                let (valid, rest) = bytes.split_at(e.valid_up_to());
                if let Ok(text) = std::str::from_utf8(valid) {
                    self.parser.feed_into(text, &mut self.parsed);
                }
                if e.error_len().is_some() {
                    // Invalid, not merely split: decode lossily and move on.
                    self.parser
                        .feed_into(&String::from_utf8_lossy(rest), &mut self.parsed);
                } else {
                    self.remainder.extend_from_slice(rest);
                }
            }
        }
    }

    fn drain_parsed(&mut self, out: &mut Vec<RawFrame>) {
        for event in self.parsed.drain(..) {
            if is_done_event(&event) {
                self.saw_done = true;
                continue;
            }
            match RawFrame::from_json(event.event.as_deref(), event.data.trim()) {
                Some(frame) => out.push(frame),
                None => {
                    self.discarded += 1;
                    tracing::trace!(
                        event = ?event.event,
                        bytes = event.data.len(),
                        "discarded non-JSON SSE frame"
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(chunks: &[&[u8]]) -> (Vec<RawFrame>, u64) {
        let mut framer = SseFramer::new();
        let mut out = Vec::new();
        for chunk in chunks {
            framer.push_bytes(chunk, &mut out);
        }
        framer.finish(&mut out);
        (out, framer.discarded())
    }

    // -- SseParser tests --

    #[test]
    fn test_parse_simple_data_frame() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: hello world\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello world");
        assert!(events[0].event.is_none());
    }

    #[test]
    fn test_parse_named_event() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: message_start\ndata: {\"type\":\"message_start\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"type\":\"message_start\"}");
    }

    #[test]
    fn test_parse_multiline_data() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: line1\ndata: line2\ndata: line3\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2\nline3");
    }

    #[test]
    fn test_parse_incremental_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: hel").is_empty());
        assert!(parser.feed("lo\n").is_empty());
        let events = parser.feed("\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_parse_crlf_and_comments() {
        let mut parser = SseParser::new();
        let events = parser.feed(": keep-alive\r\nid: 7\r\ndata: hello\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_parse_empty_lines_without_data_dont_emit() {
        let mut parser = SseParser::new();
        assert!(parser.feed("\n\n\n").is_empty());
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut parser = SseParser::new();
        let mut out = parser.feed("data: {\"x\":1}");
        assert!(out.is_empty());
        parser.finish_into(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, "{\"x\":1}");
    }

    // -- SseFramer tests --

    #[test]
    fn test_framer_skips_done_and_malformed() {
        let (out, discarded) = frames(&[
            b"data: {\"a\":1}\n\ndata: not json\n\n: comment\n\ndata: [DONE]\n\n",
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].json(), "{\"a\":1}");
        assert_eq!(discarded, 1);
    }

    #[test]
    fn test_framer_records_done_sentinel() {
        let mut framer = SseFramer::new();
        let mut out = Vec::new();
        framer.push_bytes(b"data: {\"a\":1}\n\n", &mut out);
        assert!(!framer.saw_done());
        framer.push_bytes(b"data: [DONE]\n\n", &mut out);
        assert!(framer.saw_done());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_framer_keeps_event_names() {
        let (out, _) = frames(&[
            b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\"}\n\n",
        ]);
        assert_eq!(out[0].event.as_deref(), Some("content_block_delta"));
    }

    #[test]
    fn test_framer_handles_utf8_split_across_chunks() {
        let full = "data: {\"t\":\"caf\u{e9} \u{1f600}\"}\n\n".as_bytes().to_vec();
        let emoji_at = full.len() - 7;
        let (out, _) = frames(&[&full[..emoji_at], &full[emoji_at..emoji_at + 2], &full[emoji_at + 2..]]);
        assert_eq!(out.len(), 1);
        let value: serde_json::Value = serde_json::from_str(out[0].json()).unwrap();
        assert_eq!(value["t"], "caf\u{e9} \u{1f600}");
    }

    #[test]
    fn test_framer_byte_at_a_time() {
        let body = b"data: {\"n\":1}\n\ndata: {\"n\":2}\n\n";
        let chunks: Vec<&[u8]> = body.chunks(1).collect();
        let (out, _) = frames(&chunks);
        assert_eq!(out.len(), 2);
    }
}
