//! One canonical streaming event protocol over Anthropic, OpenAI (Chat,
//! Responses, Codex) and Gemini backends.

pub mod client;
pub mod config;
pub mod cost;
pub mod error;
pub mod observability;
pub mod partial_json;
pub mod protocol;
pub mod stream;
pub mod transport;

mod util;

pub use client::{Client, StreamOptions, StreamRequest};
pub use config::{load_config, parse_config, AppConfig};
pub use cost::{CostCalculator, ModelPricing, PricingTable};
pub use error::StreamError;
pub use partial_json::parse_partial;
pub use protocol::canonical::{
    Api, AssistantMessage, ContentBlock, ErrorDetails, ErrorKind, Message, Model, StopReason,
    StreamEvent, Usage,
};
pub use protocol::transform::transform_messages;
pub use stream::AssistantMessageEventStream;
pub use transport::{RetryPolicy, Transport};
pub use tokio_util::sync::CancellationToken;
