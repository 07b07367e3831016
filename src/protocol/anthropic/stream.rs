use crate::error::classify_stream_error;
use crate::protocol::anthropic::{
    AnthropicContentBlock, AnthropicDelta, AnthropicStreamEvent, AnthropicUsage,
};
use crate::protocol::canonical::Api;
use crate::protocol::mapping::{anthropic_stop_to_canonical, anthropic_usage};
use crate::protocol::{parse_frame, push_stop_reason};
use crate::stream::{EngineOp, RawFrame, StreamDecoder};

fn usage_op(usage: AnthropicUsage) -> EngineOp {
    EngineOp::SetUsage(anthropic_usage(
        usage.input_tokens,
        usage.output_tokens,
        usage.cache_read_input_tokens,
        usage.cache_creation_input_tokens,
    ))
}

/// Anthropic Messages stream decoder.
///
/// Blocks arrive strictly one after another, each bracketed by
/// `content_block_start`/`content_block_stop` with a wire `index`. The
/// decoder remembers which wire index is open so a stray stop or delta for
/// another index cannot close or feed the wrong block.
pub struct AnthropicDecoder {
    open_index: Option<usize>,
}

impl AnthropicDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self { open_index: None }
    }

    fn decode_event(&mut self, event: AnthropicStreamEvent, out: &mut Vec<EngineOp>) {
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    out.push(usage_op(usage));
                }
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                self.open_index = Some(index);
                match content_block {
                    AnthropicContentBlock::Text { text } => {
                        out.push(EngineOp::OpenText);
                        out.push(EngineOp::AppendText(text));
                    }
                    AnthropicContentBlock::Thinking {
                        thinking,
                        signature,
                    } => {
                        out.push(EngineOp::OpenThinking);
                        out.push(EngineOp::AppendThinking {
                            delta: thinking,
                            signature,
                        });
                    }
                    AnthropicContentBlock::RedactedThinking { data } => {
                        out.push(EngineOp::OpenRedactedThinking { signature: data });
                    }
                    AnthropicContentBlock::ToolUse { id, name, input } => {
                        // `input` is `{}` when arguments follow as deltas.
                        let args = match input {
                            serde_json::Value::Object(map) if !map.is_empty() => {
                                serde_json::Value::Object(map).to_string()
                            }
                            _ => String::new(),
                        };
                        out.push(EngineOp::OpenToolCall { id, name, args });
                    }
                    AnthropicContentBlock::Other => {
                        self.open_index = None;
                        tracing::debug!(index, "ignoring unsupported content block type");
                    }
                }
            }
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
                if self.open_index != Some(index) {
                    tracing::debug!(index, open = ?self.open_index, "delta for a block that is not open");
                    return;
                }
                match delta {
                    AnthropicDelta::TextDelta { text } => out.push(EngineOp::AppendText(text)),
                    AnthropicDelta::ThinkingDelta { thinking } => {
                        out.push(EngineOp::AppendThinking {
                            delta: thinking,
                            signature: None,
                        });
                    }
                    AnthropicDelta::InputJsonDelta { partial_json } => {
                        out.push(EngineOp::AppendToolArgs(partial_json));
                    }
                    AnthropicDelta::SignatureDelta { signature } => {
                        out.push(EngineOp::AppendThinking {
                            delta: String::new(),
                            signature: Some(signature),
                        });
                    }
                    AnthropicDelta::Other => {}
                }
            }
            AnthropicStreamEvent::ContentBlockStop { index } => {
                if self.open_index == Some(index) {
                    self.open_index = None;
                    out.push(EngineOp::CloseCurrent);
                }
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    out.push(usage_op(usage));
                }
                if let Some(reason) = delta.stop_reason {
                    push_stop_reason(&reason, anthropic_stop_to_canonical(&reason), out);
                }
            }
            AnthropicStreamEvent::Error { error } => {
                let details = classify_stream_error(error.type_.as_deref(), &error.message);
                out.push(EngineOp::Fail {
                    details: Some(details),
                    message: error.message,
                });
            }
            AnthropicStreamEvent::MessageStop
            | AnthropicStreamEvent::Ping
            | AnthropicStreamEvent::Unknown => {}
        }
    }
}

impl Default for AnthropicDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder for AnthropicDecoder {
    fn decode(&mut self, frame: &RawFrame, out: &mut Vec<EngineOp>) {
        if let Some(event) = parse_frame(Api::AnthropicMessages, frame.json()) {
            self.decode_event(event, out);
        }
    }
}
