use crate::error::classify_stream_error;
use crate::protocol::canonical::Api;
use crate::protocol::mapping::{openai_stop_to_canonical, usage_with_cached_input};
use crate::protocol::openai_chat::think_tags::{Segment, ThinkTagSplitter};
use crate::protocol::openai_chat::{OpenAiStreamChunk, OpenAiStreamToolCall, OpenAiUsage};
use crate::protocol::{parse_frame, push_stop_reason};
use crate::stream::{EngineOp, RawFrame, StreamDecoder};

/// OpenAI Chat Completions (and compatible servers) stream decoder.
///
/// Chat chunks carry no block boundaries: a block implicitly ends when a
/// delta of another kind arrives. Tool calls are keyed by `index`; a new
/// index or a new id starts a new call.
pub struct OpenAiChatDecoder {
    think: ThinkTagSplitter,
    tool_index: Option<u32>,
    tool_id: Option<String>,
    segments: Vec<Segment>,
}

fn usage_op(usage: OpenAiUsage) -> EngineOp {
    let cached = usage
        .prompt_tokens_details
        .map_or(0, |details| details.cached_tokens);
    EngineOp::SetUsage(usage_with_cached_input(
        usage.prompt_tokens,
        usage.completion_tokens,
        cached,
        None,
    ))
}

impl OpenAiChatDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            think: ThinkTagSplitter::new(),
            tool_index: None,
            tool_id: None,
            segments: Vec::new(),
        }
    }

    fn drain_segments(&mut self, out: &mut Vec<EngineOp>) {
        for segment in self.segments.drain(..) {
            match segment {
                Segment::Text(text) => {
                    out.push(EngineOp::EnsureText);
                    out.push(EngineOp::AppendText(text));
                }
                Segment::Thinking(thinking) => {
                    out.push(EngineOp::EnsureThinking);
                    out.push(EngineOp::AppendThinking {
                        delta: thinking,
                        signature: None,
                    });
                }
            }
        }
    }

    /// Emit text the splitter is holding back, so it stays ahead of
    /// whatever block comes next.
    fn flush_held_text(&mut self, out: &mut Vec<EngineOp>) {
        self.think.flush(&mut self.segments);
        self.drain_segments(out);
    }

    fn leave_tool_call(&mut self) {
        self.tool_index = None;
        self.tool_id = None;
    }

    fn tool_call(&mut self, call: OpenAiStreamToolCall, out: &mut Vec<EngineOp>) {
        let function = call.function.unwrap_or_default();
        let arguments = function.arguments.unwrap_or_default();
        let new_index = call.index.is_some() && call.index != self.tool_index;
        let new_id = call
            .id
            .as_deref()
            .is_some_and(|id| !id.is_empty() && Some(id) != self.tool_id.as_deref());
        let idle = self.tool_index.is_none() && self.tool_id.is_none();
        if new_index || new_id || idle {
            self.tool_index = call.index;
            self.tool_id.clone_from(&call.id);
            out.push(EngineOp::OpenToolCall {
                id: call.id.unwrap_or_default(),
                name: function.name.unwrap_or_default(),
                args: arguments,
            });
        } else {
            out.push(EngineOp::AppendToolArgs(arguments));
        }
    }

    fn decode_chunk(&mut self, chunk: OpenAiStreamChunk, out: &mut Vec<EngineOp>) {
        if let Some(error) = chunk.error {
            let details = classify_stream_error(error.code_str(), &error.message);
            out.push(EngineOp::Fail {
                details: Some(details),
                message: error.message,
            });
            return;
        }

        if let Some(usage) = chunk.usage {
            out.push(usage_op(usage));
        }

        let Some(choice) = chunk
            .choices
            .and_then(|choices| choices.into_iter().find(|choice| choice.index == 0))
        else {
            return;
        };

        if let Some(mut delta) = choice.delta {
            if let Some((field, reasoning)) = delta.reasoning_delta() {
                self.leave_tool_call();
                out.push(EngineOp::EnsureThinking);
                // The field name lets a same-backend replay put reasoning
                // back where it came from.
                out.push(EngineOp::SetSignature(field.to_owned()));
                out.push(EngineOp::AppendThinking {
                    delta: reasoning,
                    signature: None,
                });
            }
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                self.leave_tool_call();
                self.think.feed(&content, &mut self.segments);
                self.drain_segments(out);
            }
            let calls = delta.tool_calls.unwrap_or_default();
            if !calls.is_empty() {
                self.flush_held_text(out);
            }
            for call in calls {
                self.tool_call(call, out);
            }
        }

        if let Some(reason) = choice.finish_reason.filter(|r| !r.is_empty()) {
            self.flush_held_text(out);
            self.leave_tool_call();
            out.push(EngineOp::CloseCurrent);
            push_stop_reason(&reason, openai_stop_to_canonical(&reason), out);
        }
    }
}

impl Default for OpenAiChatDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder for OpenAiChatDecoder {
    fn decode(&mut self, frame: &RawFrame, out: &mut Vec<EngineOp>) {
        if let Some(chunk) = parse_frame(Api::OpenaiCompletions, frame.json()) {
            self.decode_chunk(chunk, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{ErrorKind, StopReason};

    fn decode_all(frames: &[&str]) -> Vec<EngineOp> {
        let mut decoder = OpenAiChatDecoder::new();
        let mut out = Vec::new();
        for json in frames {
            let frame = RawFrame::from_json(None, json).unwrap();
            decoder.decode(&frame, &mut out);
        }
        out
    }

    #[test]
    fn test_text_then_finish() {
        let ops = decode_all(&[
            r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"Hi"},"finish_reason":null}]}"#,
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        ]);
        assert_eq!(
            ops,
            [
                EngineOp::EnsureText,
                EngineOp::AppendText("Hi".into()),
                EngineOp::CloseCurrent,
                EngineOp::SetStopReason(StopReason::Stop),
            ]
        );
    }

    #[test]
    fn test_tool_calls_keyed_by_index() {
        let ops = decode_all(&[
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_a","type":"function","function":{"name":"ls","arguments":""}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"p\":1}"}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"cat","arguments":"{}"}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
        ]);
        assert_eq!(
            ops[0],
            EngineOp::OpenToolCall {
                id: "call_a".into(),
                name: "ls".into(),
                args: String::new()
            }
        );
        assert_eq!(ops[1], EngineOp::AppendToolArgs("{\"p\":1}".into()));
        assert!(matches!(&ops[2], EngineOp::OpenToolCall { id, .. } if id == "call_b"));
        assert_eq!(ops[4], EngineOp::SetStopReason(StopReason::ToolUse));
    }

    #[test]
    fn test_reasoning_field_records_its_name() {
        let ops = decode_all(&[
            r#"{"choices":[{"index":0,"delta":{"reasoning_content":"think"}}]}"#,
        ]);
        assert_eq!(
            ops,
            [
                EngineOp::EnsureThinking,
                EngineOp::SetSignature("reasoning_content".into()),
                EngineOp::AppendThinking {
                    delta: "think".into(),
                    signature: None
                },
            ]
        );
    }

    #[test]
    fn test_inline_think_markup_is_split_in_order() {
        let ops = decode_all(&[
            r#"{"choices":[{"index":0,"delta":{"content":"<think>a"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":"b</think>c"}}]}"#,
        ]);
        assert_eq!(
            ops,
            [
                EngineOp::EnsureThinking,
                EngineOp::AppendThinking {
                    delta: "a".into(),
                    signature: None
                },
                EngineOp::EnsureThinking,
                EngineOp::AppendThinking {
                    delta: "b".into(),
                    signature: None
                },
                EngineOp::EnsureText,
                EngineOp::AppendText("c".into()),
            ]
        );
    }

    #[test]
    fn test_held_text_lands_before_tool_call() {
        let ops = decode_all(&[
            r#"{"choices":[{"index":0,"delta":{"content":"x <"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"ls","arguments":"{}"}}]}}]}"#,
        ]);
        assert_eq!(
            ops,
            [
                EngineOp::EnsureText,
                EngineOp::AppendText("x ".into()),
                EngineOp::EnsureText,
                EngineOp::AppendText("<".into()),
                EngineOp::OpenToolCall {
                    id: "call_a".into(),
                    name: "ls".into(),
                    args: "{}".into()
                },
            ]
        );
    }

    #[test]
    fn test_usage_subtracts_cached_tokens() {
        let ops = decode_all(&[
            r#"{"choices":[],"usage":{"prompt_tokens":100,"completion_tokens":20,"total_tokens":120,"prompt_tokens_details":{"cached_tokens":40}}}"#,
        ]);
        let EngineOp::SetUsage(patch) = ops[0] else {
            panic!("expected usage");
        };
        let usage = patch.into_usage();
        assert_eq!((usage.input, usage.cache_read, usage.output), (60, 40, 20));
    }

    #[test]
    fn test_content_filter_fails() {
        let ops = decode_all(&[
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"content_filter"}]}"#,
        ]);
        assert!(matches!(ops.last(), Some(EngineOp::Fail { details: None, .. })));
    }

    #[test]
    fn test_error_chunk() {
        let ops = decode_all(&[
            r#"{"error":{"message":"Rate limit reached","type":"requests","code":"rate_limit_exceeded"}}"#,
        ]);
        match &ops[0] {
            EngineOp::Fail {
                details: Some(details),
                ..
            } => assert_eq!(details.kind, ErrorKind::RateLimit),
            other => panic!("unexpected {other:?}"),
        }
    }
}
