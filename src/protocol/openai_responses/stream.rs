use serde_json::value::RawValue;

use crate::error::classify_stream_error;
use crate::protocol::canonical::Api;
use crate::protocol::mapping::{responses_status_to_canonical, usage_with_cached_input};
use crate::protocol::openai_responses::{
    ResponsesOutputItem, ResponsesResponse, ResponsesStreamEvent,
};
use crate::protocol::{parse_frame, push_stop_reason};
use crate::stream::{EngineOp, RawFrame, StreamDecoder};

const SUMMARY_PART_SEPARATOR: &str = "\n\n";

/// Decoder for the OpenAI Responses family, shared by the public Responses
/// API and the Codex backend (which adds `response.done`).
pub struct ResponsesDecoder {
    api: Api,
    /// Whether the open tool call received argument deltas; some servers
    /// only send the full arguments on `output_item.done`.
    args_streamed: bool,
}

impl ResponsesDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            api: Api::OpenaiResponses,
            args_streamed: false,
        }
    }

    #[must_use]
    pub fn codex() -> Self {
        Self {
            api: Api::OpenaiCodexResponses,
            args_streamed: false,
        }
    }

    fn parse_item(&self, event: &ResponsesStreamEvent) -> Option<ResponsesOutputItem> {
        event
            .item
            .as_deref()
            .and_then(|raw| parse_frame(self.api, raw.get()))
    }

    fn item_added(&mut self, item: ResponsesOutputItem, out: &mut Vec<EngineOp>) {
        match item.type_.as_str() {
            "reasoning" => out.push(EngineOp::OpenThinking),
            "message" => out.push(EngineOp::OpenText),
            "function_call" => {
                self.args_streamed = false;
                out.push(EngineOp::OpenToolCall {
                    id: item.composite_call_id(),
                    name: item.name.unwrap_or_default(),
                    args: item.arguments.unwrap_or_default(),
                });
            }
            other => tracing::debug!(api = %self.api, item_type = other, "ignoring output item"),
        }
    }

    fn item_done(
        &mut self,
        item: ResponsesOutputItem,
        raw: Option<&str>,
        out: &mut Vec<EngineOp>,
    ) {
        match item.type_.as_str() {
            "reasoning" => {
                // The whole item (encrypted content included) is the
                // continuation token for the next turn.
                if let Some(raw) = raw {
                    out.push(EngineOp::SetSignature(raw.to_owned()));
                }
                out.push(EngineOp::CloseCurrent);
            }
            "message" => {
                if let Some(id) = item.id {
                    out.push(EngineOp::SetSignature(id));
                }
                out.push(EngineOp::CloseCurrent);
            }
            "function_call" => {
                if !self.args_streamed {
                    if let Some(arguments) = item.arguments {
                        out.push(EngineOp::AppendToolArgs(arguments));
                    }
                }
                self.args_streamed = false;
                out.push(EngineOp::CloseCurrent);
            }
            _ => {}
        }
    }

    fn response_finished(&self, response: ResponsesResponse, out: &mut Vec<EngineOp>) {
        if let Some(usage) = response.usage {
            let cached = usage
                .input_tokens_details
                .map_or(0, |details| details.cached_tokens);
            out.push(EngineOp::SetUsage(usage_with_cached_input(
                usage.input_tokens,
                usage.output_tokens,
                cached,
                usage.total_tokens,
            )));
        }
        let status = response.status.as_deref().unwrap_or("completed");
        push_stop_reason(status, responses_status_to_canonical(status), out);
    }

    fn decode_event(&mut self, event: ResponsesStreamEvent, out: &mut Vec<EngineOp>) {
        match event.type_.as_str() {
            "response.output_item.added" => {
                if let Some(item) = self.parse_item(&event) {
                    self.item_added(item, out);
                }
            }
            "response.output_item.done" => {
                if let Some(item) = self.parse_item(&event) {
                    let raw = event.item.as_deref().map(RawValue::get);
                    self.item_done(item, raw, out);
                }
            }
            "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                out.push(EngineOp::AppendThinking {
                    delta: event.delta.unwrap_or_default(),
                    signature: None,
                });
            }
            "response.reasoning_summary_part.done" => {
                out.push(EngineOp::AppendThinking {
                    delta: SUMMARY_PART_SEPARATOR.to_owned(),
                    signature: None,
                });
            }
            "response.output_text.delta" | "response.refusal.delta" => {
                out.push(EngineOp::AppendText(event.delta.unwrap_or_default()));
            }
            "response.function_call_arguments.delta" => {
                self.args_streamed = true;
                out.push(EngineOp::AppendToolArgs(event.delta.unwrap_or_default()));
            }
            "response.completed" | "response.done" | "response.incomplete" => {
                self.response_finished(event.response.unwrap_or_default(), out);
            }
            "response.failed" => {
                let error = event
                    .response
                    .and_then(|response| response.error)
                    .unwrap_or_default();
                let message = if error.message.is_empty() {
                    "Response failed".to_owned()
                } else {
                    error.message
                };
                out.push(EngineOp::Fail {
                    details: Some(classify_stream_error(error.code.as_deref(), &message)),
                    message,
                });
            }
            "error" => {
                let message = event
                    .message
                    .filter(|m| !m.is_empty())
                    .or_else(|| event.code.clone())
                    .unwrap_or_else(|| "Unknown stream error".to_owned());
                out.push(EngineOp::Fail {
                    details: Some(classify_stream_error(event.code.as_deref(), &message)),
                    message,
                });
            }
            _ => {}
        }
    }
}

impl Default for ResponsesDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder for ResponsesDecoder {
    fn decode(&mut self, frame: &RawFrame, out: &mut Vec<EngineOp>) {
        if let Some(event) = parse_frame(self.api, frame.json()) {
            self.decode_event(event, out);
        }
    }
}
