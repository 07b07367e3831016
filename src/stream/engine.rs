//! Block lifecycle engine: the single writer of one in-flight
//! [`AssistantMessage`].
//!
//! Decoders hand it [`EngineOp`]s; it keeps `content` and the open-block
//! pointer consistent and emits canonical [`StreamEvent`]s. Exactly one block
//! is open at a time, and opening a block always closes the current one
//! first (emitting its `*_end`).

use std::sync::Arc;

use rustc_hash::FxHashSet;

use super::EngineOp;
use crate::cost::CostCalculator;
use crate::partial_json::{parse_partial, parse_partial_object};
use crate::protocol::canonical::{
    AssistantMessage, ContentBlock, ErrorDetails, Model, StopReason, StreamEvent, TextContent,
    ThinkingContent, ToolCall, UsagePatch,
};
use crate::util::{synthesize_tool_call_id, unix_now_millis};

/// Which kind of block is currently accepting deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Idle,
    Text,
    Thinking,
    ToolCall,
}

enum OpenBlock {
    Text { index: usize },
    Thinking { index: usize },
    ToolCall { index: usize, raw_args: String },
}

/// Result of applying one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    Continue,
    /// The backend reported a failure; the caller decides between retrying
    /// and terminating with [`BlockEngine::fail`].
    Failed {
        details: Option<ErrorDetails>,
        message: String,
    },
}

pub struct BlockEngine {
    model: Model,
    message: Arc<AssistantMessage>,
    current: Option<OpenBlock>,
    pending_usage: UsagePatch,
    stop_reason: Option<StopReason>,
    tool_call_ids: FxHashSet<String>,
    cost: Option<Arc<dyn CostCalculator>>,
    started: bool,
    emitted_content: bool,
    finished: bool,
}

impl BlockEngine {
    #[must_use]
    pub fn new(model: &Model) -> Self {
        Self {
            model: model.clone(),
            message: Arc::new(AssistantMessage::empty(model, unix_now_millis())),
            current: None,
            pending_usage: UsagePatch::default(),
            stop_reason: None,
            tool_call_ids: FxHashSet::default(),
            cost: None,
            started: false,
            emitted_content: false,
            finished: false,
        }
    }

    #[must_use]
    pub fn with_cost_calculator(mut self, cost: Arc<dyn CostCalculator>) -> Self {
        self.cost = Some(cost);
        self
    }

    #[must_use]
    pub fn state(&self) -> BlockState {
        match self.current {
            None => BlockState::Idle,
            Some(OpenBlock::Text { .. }) => BlockState::Text,
            Some(OpenBlock::Thinking { .. }) => BlockState::Thinking,
            Some(OpenBlock::ToolCall { .. }) => BlockState::ToolCall,
        }
    }

    /// The live message. Prefer event snapshots outside the pipeline.
    #[must_use]
    pub fn message(&self) -> &AssistantMessage {
        &self.message
    }

    /// True once any block has been opened, i.e. content reached the caller.
    #[must_use]
    pub fn has_emitted_content(&self) -> bool {
        self.emitted_content
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the backend has reported why it stopped.
    #[must_use]
    pub fn has_stop_reason(&self) -> bool {
        self.stop_reason.is_some()
    }

    /// Forget per-attempt bookkeeping before a retried connection. Only valid
    /// while no content has been emitted.
    pub fn reset_attempt(&mut self) {
        debug_assert!(!self.emitted_content);
        self.pending_usage = UsagePatch::default();
        self.stop_reason = None;
    }

    fn snapshot(&self) -> Arc<AssistantMessage> {
        Arc::clone(&self.message)
    }

    fn msg(&mut self) -> &mut AssistantMessage {
        Arc::make_mut(&mut self.message)
    }

    /// Emit the initial `start` event. Idempotent.
    pub fn start(&mut self, out: &mut Vec<StreamEvent>) {
        if self.started || self.finished {
            return;
        }
        self.started = true;
        out.push(StreamEvent::Start {
            partial: self.snapshot(),
        });
    }

    pub fn apply(&mut self, op: EngineOp, out: &mut Vec<StreamEvent>) -> OpOutcome {
        if self.finished {
            return OpOutcome::Continue;
        }
        match op {
            EngineOp::OpenText => self.open_text(out),
            EngineOp::EnsureText => {
                if self.state() != BlockState::Text {
                    self.open_text(out);
                }
            }
            EngineOp::AppendText(delta) => self.append_text(delta, out),
            EngineOp::OpenThinking => self.open_thinking(out),
            EngineOp::EnsureThinking => {
                if self.state() != BlockState::Thinking {
                    self.open_thinking(out);
                }
            }
            EngineOp::OpenRedactedThinking { signature } => {
                self.open_thinking(out);
                if let Some(OpenBlock::Thinking { index }) = self.current {
                    if let Some(ContentBlock::Thinking(block)) = self.msg().content.get_mut(index)
                    {
                        block.redacted = true;
                        block.thinking_signature = Some(signature);
                    }
                }
            }
            EngineOp::AppendThinking { delta, signature } => {
                self.append_thinking(delta, signature, out);
            }
            EngineOp::OpenToolCall { id, name, args } => {
                self.open_tool_call(id, name, args, None, out);
            }
            EngineOp::AppendToolArgs(delta) => self.append_tool_args(delta, out),
            EngineOp::EmitCompleteToolCall {
                id,
                name,
                arguments,
                thought_signature,
            } => self.emit_complete_tool_call(id, name, &arguments, thought_signature, out),
            EngineOp::SetSignature(signature) => self.set_signature(signature),
            EngineOp::CloseCurrent => self.close_current(out),
            EngineOp::SetUsage(patch) => self.pending_usage.merge(patch),
            EngineOp::SetStopReason(reason) => self.stop_reason = Some(reason),
            EngineOp::Fail { details, message } => {
                return OpOutcome::Failed { details, message };
            }
        }
        OpOutcome::Continue
    }

    // -----------------------------------------------------------------------
    // Opening blocks
    // -----------------------------------------------------------------------

    fn push_block(&mut self, block: ContentBlock) -> usize {
        let msg = self.msg();
        msg.content.push(block);
        msg.content.len() - 1
    }

    fn open_text(&mut self, out: &mut Vec<StreamEvent>) {
        self.close_current(out);
        let index = self.push_block(ContentBlock::Text(TextContent::default()));
        self.current = Some(OpenBlock::Text { index });
        self.emitted_content = true;
        out.push(StreamEvent::TextStart {
            content_index: index,
            partial: self.snapshot(),
        });
    }

    fn open_thinking(&mut self, out: &mut Vec<StreamEvent>) {
        self.close_current(out);
        let index = self.push_block(ContentBlock::Thinking(ThinkingContent::default()));
        self.current = Some(OpenBlock::Thinking { index });
        self.emitted_content = true;
        out.push(StreamEvent::ThinkingStart {
            content_index: index,
            partial: self.snapshot(),
        });
    }

    /// Keep ids unique within the message; backends sometimes omit or reuse
    /// them.
    fn unique_tool_call_id(&mut self, id: String, name: &str) -> String {
        let id = if id.is_empty() || self.tool_call_ids.contains(&id) {
            let fresh = synthesize_tool_call_id(name);
            tracing::debug!(original = %id, fresh = %fresh, "replaced missing or duplicate tool call id");
            fresh
        } else {
            id
        };
        self.tool_call_ids.insert(id.clone());
        id
    }

    fn open_tool_call(
        &mut self,
        id: String,
        name: String,
        args: String,
        thought_signature: Option<String>,
        out: &mut Vec<StreamEvent>,
    ) {
        self.close_current(out);
        let id = self.unique_tool_call_id(id, &name);
        let index = self.push_block(ContentBlock::ToolCall(ToolCall {
            id,
            name,
            arguments: serde_json::Map::new(),
            thought_signature,
        }));
        self.current = Some(OpenBlock::ToolCall {
            index,
            raw_args: String::new(),
        });
        self.emitted_content = true;
        out.push(StreamEvent::ToolCallStart {
            content_index: index,
            partial: self.snapshot(),
        });
        self.append_tool_args(args, out);
    }

    fn emit_complete_tool_call(
        &mut self,
        id: Option<String>,
        name: String,
        arguments: &serde_json::Value,
        thought_signature: Option<String>,
        out: &mut Vec<StreamEvent>,
    ) {
        let args = match arguments {
            serde_json::Value::Object(_) => arguments.to_string(),
            _ => "{}".to_owned(),
        };
        self.open_tool_call(id.unwrap_or_default(), name, String::new(), thought_signature, out);
        self.append_tool_args(args, out);
        self.close_current(out);
    }

    // -----------------------------------------------------------------------
    // Deltas
    // -----------------------------------------------------------------------

    fn append_text(&mut self, delta: String, out: &mut Vec<StreamEvent>) {
        let Some(OpenBlock::Text { index }) = self.current else {
            tracing::warn!(state = ?self.state(), "text delta without an open text block, ignored");
            return;
        };
        if delta.is_empty() {
            return;
        }
        if let Some(ContentBlock::Text(block)) = self.msg().content.get_mut(index) {
            block.text.push_str(&delta);
        }
        out.push(StreamEvent::TextDelta {
            content_index: index,
            delta,
            partial: self.snapshot(),
        });
    }

    fn append_thinking(
        &mut self,
        delta: String,
        signature: Option<String>,
        out: &mut Vec<StreamEvent>,
    ) {
        let Some(OpenBlock::Thinking { index }) = self.current else {
            tracing::warn!(state = ?self.state(), "thinking delta without an open thinking block, ignored");
            return;
        };
        if let Some(ContentBlock::Thinking(block)) = self.msg().content.get_mut(index) {
            block.thinking.push_str(&delta);
            if let Some(signature) = signature {
                block
                    .thinking_signature
                    .get_or_insert_with(String::new)
                    .push_str(&signature);
            }
        }
        if delta.is_empty() {
            return;
        }
        out.push(StreamEvent::ThinkingDelta {
            content_index: index,
            delta,
            partial: self.snapshot(),
        });
    }

    fn append_tool_args(&mut self, delta: String, out: &mut Vec<StreamEvent>) {
        let index = match self.current.as_mut() {
            Some(OpenBlock::ToolCall { index, raw_args }) => {
                raw_args.push_str(&delta);
                *index
            }
            _ => {
                tracing::warn!(state = ?self.state(), "tool argument delta without an open tool call, ignored");
                return;
            }
        };
        if delta.is_empty() {
            return;
        }
        let arguments = match &self.current {
            Some(OpenBlock::ToolCall { raw_args, .. }) => parse_partial_object(raw_args),
            _ => serde_json::Map::new(),
        };
        if let Some(ContentBlock::ToolCall(call)) = self.msg().content.get_mut(index) {
            call.arguments = arguments;
        }
        out.push(StreamEvent::ToolCallDelta {
            content_index: index,
            delta,
            partial: self.snapshot(),
        });
    }

    fn set_signature(&mut self, signature: String) {
        let index = match self.current {
            Some(
                OpenBlock::Text { index }
                | OpenBlock::Thinking { index }
                | OpenBlock::ToolCall { index, .. },
            ) => index,
            None => {
                tracing::warn!("signature without an open block, ignored");
                return;
            }
        };
        match self.msg().content.get_mut(index) {
            Some(ContentBlock::Text(block)) => block.text_signature = Some(signature),
            Some(ContentBlock::Thinking(block)) => block.thinking_signature = Some(signature),
            Some(ContentBlock::ToolCall(call)) => call.thought_signature = Some(signature),
            None => {}
        }
    }

    // -----------------------------------------------------------------------
    // Closing and terminal transitions
    // -----------------------------------------------------------------------

    fn close_current(&mut self, out: &mut Vec<StreamEvent>) {
        let Some(block) = self.current.take() else {
            return;
        };
        match block {
            OpenBlock::Text { index } => {
                let content = self.message.content[index]
                    .as_text()
                    .unwrap_or_default()
                    .to_owned();
                out.push(StreamEvent::TextEnd {
                    content_index: index,
                    content,
                    partial: self.snapshot(),
                });
            }
            OpenBlock::Thinking { index } => {
                let content = self.message.content[index]
                    .as_thinking()
                    .unwrap_or_default()
                    .to_owned();
                out.push(StreamEvent::ThinkingEnd {
                    content_index: index,
                    content,
                    partial: self.snapshot(),
                });
            }
            OpenBlock::ToolCall { index, raw_args } => {
                let arguments = complete_arguments(&raw_args);
                let mut tool_call = None;
                if let Some(ContentBlock::ToolCall(call)) = self.msg().content.get_mut(index) {
                    call.arguments = arguments;
                    tool_call = Some(call.clone());
                }
                if let Some(tool_call) = tool_call {
                    out.push(StreamEvent::ToolCallEnd {
                        content_index: index,
                        tool_call,
                        partial: self.snapshot(),
                    });
                }
            }
        }
    }

    fn finalize_usage(&mut self) {
        let mut usage = self.pending_usage.into_usage();
        if let Some(cost) = &self.cost {
            usage.cost = cost.calculate(&self.model, &usage);
        }
        self.msg().usage = usage;
    }

    /// Terminal success transition: close any open block, settle usage and
    /// the stop reason, emit `done`.
    ///
    /// A stop reason of [`StopReason::Error`] or [`StopReason::Aborted`]
    /// ends the stream through [`BlockEngine::fail`] instead.
    pub fn finish(&mut self, out: &mut Vec<StreamEvent>) {
        if self.finished {
            return;
        }
        let mut reason = self.stop_reason.unwrap_or_default();
        match reason {
            StopReason::Error | StopReason::Aborted => {
                self.fail(
                    reason,
                    None,
                    "Provider ended the response with an error".to_owned(),
                    out,
                );
                return;
            }
            StopReason::Stop if self.message.has_tool_calls() => reason = StopReason::ToolUse,
            _ => {}
        }
        self.close_current(out);
        self.finalize_usage();
        self.msg().stop_reason = reason;
        self.finished = true;
        out.push(StreamEvent::Done {
            reason,
            message: self.snapshot(),
        });
    }

    /// Terminal failure transition. Open blocks are force-closed with what
    /// they accumulated; partial content stays on the message.
    pub fn fail(
        &mut self,
        reason: StopReason,
        details: Option<ErrorDetails>,
        message: String,
        out: &mut Vec<StreamEvent>,
    ) {
        if self.finished {
            return;
        }
        self.close_current(out);
        self.finalize_usage();
        let msg = self.msg();
        msg.stop_reason = reason;
        msg.error_message = Some(message);
        msg.error_details = details;
        self.finished = true;
        out.push(StreamEvent::Error {
            reason,
            error: self.snapshot(),
        });
    }
}

/// Arguments at `toolcall_end`: exact parse when the buffer is complete JSON,
/// best effort otherwise.
fn complete_arguments(raw: &str) -> serde_json::Map<String, serde_json::Value> {
    if raw.trim().is_empty() {
        return serde_json::Map::new();
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(_) => serde_json::Map::new(),
        Err(_) => match parse_partial(raw) {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        },
    }
}
