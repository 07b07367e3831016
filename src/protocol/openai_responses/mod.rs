pub mod stream;

use serde::Deserialize;
use serde_json::value::RawValue;

/// One Responses SSE payload. The event family is wide and grows often, so
/// this is a flat view over the fields the decoder reads, dispatched on
/// `type`. `item` stays raw: reasoning items are kept verbatim.
#[derive(Debug, Deserialize)]
pub struct ResponsesStreamEvent {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub item: Option<Box<RawValue>>,
    #[serde(default)]
    pub delta: Option<String>,
    #[serde(default)]
    pub response: Option<ResponsesResponse>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// An output item as announced by `response.output_item.*`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponsesOutputItem {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

impl ResponsesOutputItem {
    /// `call_id|item_id`: both halves are needed to send the result back.
    #[must_use]
    pub fn composite_call_id(&self) -> String {
        match (self.call_id.as_deref(), self.id.as_deref()) {
            (Some(call_id), Some(item_id)) => format!("{call_id}|{item_id}"),
            (Some(call_id), None) => call_id.to_owned(),
            (None, Some(item_id)) => item_id.to_owned(),
            (None, None) => String::new(),
        }
    }
}

/// The response object carried by terminal events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub usage: Option<ResponsesUsage>,
    #[serde(default)]
    pub error: Option<ResponsesError>,
}

/// Usage. `input_tokens` includes cached tokens.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ResponsesUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub input_tokens_details: Option<ResponsesInputTokensDetails>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ResponsesInputTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}
