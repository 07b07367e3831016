//! Splits inline `<think>...</think>` markup out of a streamed text field.
//!
//! Tags may be cut anywhere by chunking, so a trailing fragment that could
//! still become a tag is held back until the next chunk decides it.

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

/// One run of text, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Thinking(String),
}

#[derive(Debug, Default)]
pub struct ThinkTagSplitter {
    inside: bool,
    carry: String,
}

/// Length of the longest proper prefix of `tag` that `text` ends with.
fn partial_tag_suffix(text: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&len| text.ends_with(&tag[..len]))
        .unwrap_or(0)
}

impl ThinkTagSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, text: &str, out: &mut Vec<Segment>) {
        if text.is_empty() {
            return;
        }
        let segment = if self.inside {
            Segment::Thinking(text.to_owned())
        } else {
            Segment::Text(text.to_owned())
        };
        out.push(segment);
    }

    pub fn feed(&mut self, chunk: &str, out: &mut Vec<Segment>) {
        let mut buffer = std::mem::take(&mut self.carry);
        buffer.push_str(chunk);
        let mut rest = buffer.as_str();
        loop {
            let tag = if self.inside { CLOSE_TAG } else { OPEN_TAG };
            if let Some(pos) = rest.find(tag) {
                self.push(&rest[..pos], out);
                rest = &rest[pos + tag.len()..];
                self.inside = !self.inside;
                continue;
            }
            let keep = partial_tag_suffix(rest, tag);
            let (emit, held) = rest.split_at(rest.len() - keep);
            self.push(emit, out);
            self.carry = held.to_owned();
            return;
        }
    }

    /// Release anything held back; called when the text field is done.
    pub fn flush(&mut self, out: &mut Vec<Segment>) {
        let carry = std::mem::take(&mut self.carry);
        self.push(&carry, out);
    }
}
