use crate::error::classify_stream_error;
use crate::protocol::canonical::Api;
use crate::protocol::gemini::{
    GeminiCliEnvelope, GeminiError, GeminiPart, GeminiResponse, GeminiUsageMetadata,
};
use crate::protocol::mapping::{gemini_stop_to_canonical, usage_with_cached_input};
use crate::protocol::{parse_frame, push_stop_reason};
use crate::stream::{EngineOp, RawFrame, StreamDecoder};

fn usage_op(usage: GeminiUsageMetadata) -> EngineOp {
    EngineOp::SetUsage(usage_with_cached_input(
        usage.prompt_token_count,
        usage.candidates_token_count + usage.thoughts_token_count,
        usage.cached_content_token_count,
        usage.total_token_count,
    ))
}

fn error_op(error: GeminiError) -> EngineOp {
    let message = if error.message.is_empty() {
        "Gemini stream error".to_owned()
    } else {
        error.message
    };
    EngineOp::Fail {
        details: Some(classify_stream_error(error.status.as_deref(), &message)),
        message,
    }
}

/// Gemini stream decoder. Text and reasoning arrive as parts of one
/// `content`, told apart by `thought`; function calls arrive whole.
pub struct GeminiDecoder {
    cli_envelope: bool,
}

impl GeminiDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cli_envelope: false,
        }
    }

    /// Decoder for the Cloud Code Assist envelope.
    #[must_use]
    pub fn cli() -> Self {
        Self { cli_envelope: true }
    }

    fn api(&self) -> Api {
        if self.cli_envelope {
            Api::GoogleGeminiCli
        } else {
            Api::GoogleGenerativeAi
        }
    }

    fn decode_part(part: GeminiPart, out: &mut Vec<EngineOp>) {
        if let Some(call) = part.function_call {
            out.push(EngineOp::EmitCompleteToolCall {
                id: call.id.filter(|id| !id.is_empty()),
                name: call.name,
                arguments: call.args,
                thought_signature: part.thought_signature,
            });
            return;
        }
        let Some(text) = part.text else {
            return;
        };
        if part.thought {
            out.push(EngineOp::EnsureThinking);
            out.push(EngineOp::AppendThinking {
                delta: text,
                signature: None,
            });
        } else {
            out.push(EngineOp::EnsureText);
            out.push(EngineOp::AppendText(text));
        }
        if let Some(signature) = part.thought_signature.filter(|s| !s.is_empty()) {
            out.push(EngineOp::SetSignature(signature));
        }
    }

    fn decode_response(response: GeminiResponse, out: &mut Vec<EngineOp>) {
        if let Some(error) = response.error {
            out.push(error_op(error));
            return;
        }
        let candidate = response
            .candidates
            .and_then(|candidates| candidates.into_iter().next());
        let mut finish_reason = None;
        if let Some(candidate) = candidate {
            for part in candidate.content.unwrap_or_default().parts {
                Self::decode_part(part, out);
            }
            finish_reason = candidate.finish_reason;
        }
        if let Some(usage) = response.usage_metadata {
            out.push(usage_op(usage));
        }
        if let Some(reason) = finish_reason {
            out.push(EngineOp::CloseCurrent);
            push_stop_reason(&reason, gemini_stop_to_canonical(&reason), out);
        }
    }
}

impl Default for GeminiDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder for GeminiDecoder {
    fn decode(&mut self, frame: &RawFrame, out: &mut Vec<EngineOp>) {
        if self.cli_envelope {
            let Some(envelope) = parse_frame::<GeminiCliEnvelope>(self.api(), frame.json()) else {
                return;
            };
            if let Some(error) = envelope.error {
                out.push(error_op(error));
            } else if let Some(response) = envelope.response {
                Self::decode_response(response, out);
            }
        } else if let Some(response) = parse_frame(self.api(), frame.json()) {
            Self::decode_response(response, out);
        }
    }
}
