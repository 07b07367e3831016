pub mod anthropic;
pub mod canonical;
pub mod gemini;
pub mod mapping;
pub mod openai_chat;
pub mod openai_responses;
pub mod transform;

use canonical::{Api, StopReason};

use crate::stream::{EngineOp, StreamDecoder};

/// Fresh decoder for one stream against `api`.
#[must_use]
pub fn decoder_for(api: Api) -> Box<dyn StreamDecoder> {
    match api {
        Api::AnthropicMessages => Box::new(anthropic::stream::AnthropicDecoder::new()),
        Api::OpenaiCompletions => Box::new(openai_chat::stream::OpenAiChatDecoder::new()),
        Api::OpenaiResponses => Box::new(openai_responses::stream::ResponsesDecoder::new()),
        Api::OpenaiCodexResponses => {
            Box::new(openai_responses::stream::ResponsesDecoder::codex())
        }
        Api::GoogleGenerativeAi => Box::new(gemini::stream::GeminiDecoder::new()),
        Api::GoogleGeminiCli => Box::new(gemini::stream::GeminiDecoder::cli()),
    }
}

/// Record a mapped stop reason. Reasons that map to [`StopReason::Error`]
/// (refusals, safety blocks) end the stream with the raw reason in the
/// error message.
pub(crate) fn push_stop_reason(raw: &str, reason: StopReason, out: &mut Vec<EngineOp>) {
    if reason == StopReason::Error {
        out.push(EngineOp::Fail {
            details: None,
            message: format!("Provider finish_reason: {raw}"),
        });
    } else {
        out.push(EngineOp::SetStopReason(reason));
    }
}

/// Parse a frame payload, logging and skipping shapes we do not model.
pub(crate) fn parse_frame<'a, T: serde::Deserialize<'a>>(
    api: Api,
    json: &'a str,
) -> Option<T> {
    match serde_json::from_str(json) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::trace!(api = %api, error = %err, "skipping frame with unexpected shape");
            None
        }
    }
}
