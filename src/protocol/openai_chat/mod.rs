pub mod stream;
pub mod think_tags;

use serde::Deserialize;

/// A streaming chunk. Error chunks carry only `error`; the final usage
/// chunk has empty `choices`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiStreamChunk {
    #[serde(default)]
    pub choices: Option<Vec<OpenAiStreamChoice>>,
    #[serde(default)]
    pub usage: Option<OpenAiUsage>,
    #[serde(default)]
    pub error: Option<OpenAiErrorBody>,
}

/// A choice within a stream chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiStreamChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Option<OpenAiDelta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Delta content within a stream choice. Compatible servers disagree on
/// where reasoning goes, hence the three reasoning fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub reasoning_text: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

impl OpenAiDelta {
    /// The first non-empty reasoning field and its wire name.
    #[must_use]
    pub fn reasoning_delta(&mut self) -> Option<(&'static str, String)> {
        [
            ("reasoning_content", self.reasoning_content.take()),
            ("reasoning", self.reasoning.take()),
            ("reasoning_text", self.reasoning_text.take()),
        ]
        .into_iter()
        .find_map(|(field, value)| value.filter(|v| !v.is_empty()).map(|v| (field, v)))
    }
}

/// A tool call delta in streaming.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiStreamToolCall {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<OpenAiStreamToolCallFunction>,
}

/// Function delta within a streaming tool call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiStreamToolCallFunction {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Usage info. `prompt_tokens` includes cached tokens.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct OpenAiUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub prompt_tokens_details: Option<OpenAiPromptTokensDetails>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct OpenAiPromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
}

/// `{"error": {...}}` sent mid-stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub type_: Option<String>,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
}

impl OpenAiErrorBody {
    /// `code` is a string on OpenAI and a number on some compatible servers.
    #[must_use]
    pub fn code_str(&self) -> Option<&str> {
        self.code
            .as_ref()
            .and_then(serde_json::Value::as_str)
            .or(self.type_.as_deref())
    }
}
