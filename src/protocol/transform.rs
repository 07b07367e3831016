//! Rewrites canonical history produced by one backend into input another
//! backend accepts.

use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashMap, FxHashSet, FxHasher};

use super::canonical::{
    AssistantMessage, ContentBlock, Message, Model, StopReason, TextContent, ToolCall,
    ToolResultMessage, UserContent,
};

const MISSING_RESULT_TEXT: &str = "No result provided";
const MAX_FOREIGN_TOOL_CALL_ID_LEN: usize = 64;

fn produced_by(message: &AssistantMessage, target: &Model) -> bool {
    message.api == target.api && message.provider == target.provider && message.model == target.id
}

/// Backends disagree on allowed id characters; the Responses composite id
/// (`call|item`) in particular is rejected elsewhere. A rewritten id carries a
/// hash of the original so distinct ids stay distinct.
fn foreign_tool_call_id(id: &str) -> String {
    let sanitized: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized == id && sanitized.len() <= MAX_FOREIGN_TOOL_CALL_ID_LEN {
        return sanitized;
    }

    let mut hasher = FxHasher::default();
    id.hash(&mut hasher);
    let suffix = format!("_{:08x}", hasher.finish() & 0xffff_ffff);
    // Sanitized ids are ASCII, so byte and char counts agree.
    let mut out: String = sanitized
        .chars()
        .take(MAX_FOREIGN_TOOL_CALL_ID_LEN - suffix.len())
        .collect();
    out.push_str(&suffix);
    out
}

fn thinking_as_text(thinking: &str) -> ContentBlock {
    ContentBlock::Text(TextContent {
        text: format!("<thinking>\n{thinking}\n</thinking>"),
        text_signature: None,
    })
}

struct Rewriter<'a> {
    target: &'a Model,
    /// Replayed tool call ids, original to rewritten.
    call_ids: FxHashMap<String, String>,
    /// Calls of the latest assistant turn still waiting for a result.
    pending: Vec<(String, String)>,
    answered: FxHashSet<String>,
    out: Vec<Message>,
}

impl<'a> Rewriter<'a> {
    fn new(target: &'a Model, capacity: usize) -> Self {
        Self {
            target,
            call_ids: FxHashMap::default(),
            pending: Vec::new(),
            answered: FxHashSet::default(),
            out: Vec::with_capacity(capacity),
        }
    }

    fn flush_missing_results(&mut self, timestamp: u64) {
        for (id, name) in self.pending.drain(..) {
            if self.answered.contains(&id) {
                continue;
            }
            tracing::debug!(tool_call_id = %id, "inserting synthetic result for unanswered tool call");
            self.out.push(Message::ToolResult(ToolResultMessage {
                tool_call_id: id,
                tool_name: name,
                content: vec![UserContent::text(MISSING_RESULT_TEXT)],
                is_error: true,
                timestamp,
            }));
        }
        self.answered.clear();
    }

    fn filter_images(&self, content: &[UserContent]) -> Vec<UserContent> {
        content
            .iter()
            .filter(|part| self.target.vision || !matches!(part, UserContent::Image(_)))
            .cloned()
            .collect()
    }

    fn rewrite_block(&mut self, block: &ContentBlock, same: bool) -> Option<ContentBlock> {
        match block {
            ContentBlock::Text(text) => {
                let mut text = text.clone();
                if !same {
                    text.text_signature = None;
                }
                Some(ContentBlock::Text(text))
            }
            ContentBlock::Thinking(thinking) => {
                if same {
                    // A signature-only block still carries state the backend
                    // needs to resume reasoning.
                    let keep = !thinking.thinking.trim().is_empty()
                        || thinking.thinking_signature.is_some();
                    return keep.then(|| block.clone());
                }
                if thinking.redacted || thinking.thinking.trim().is_empty() {
                    return None;
                }
                Some(thinking_as_text(&thinking.thinking))
            }
            ContentBlock::ToolCall(call) => {
                let id = if same {
                    call.id.clone()
                } else {
                    foreign_tool_call_id(&call.id)
                };
                self.call_ids.insert(call.id.clone(), id.clone());
                self.pending.push((id.clone(), call.name.clone()));
                Some(ContentBlock::ToolCall(ToolCall {
                    id,
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    thought_signature: if same {
                        call.thought_signature.clone()
                    } else {
                        None
                    },
                }))
            }
        }
    }

    fn assistant(&mut self, message: &AssistantMessage) {
        self.flush_missing_results(message.timestamp);
        let same = produced_by(message, self.target);
        let failed = matches!(message.stop_reason, StopReason::Error | StopReason::Aborted);
        let mut content = Vec::with_capacity(message.content.len());
        for block in &message.content {
            if failed && !matches!(block, ContentBlock::Text(_)) {
                continue;
            }
            if let Some(block) = self.rewrite_block(block, same) {
                content.push(block);
            }
        }
        if content.is_empty() {
            return;
        }
        let mut message = message.clone();
        message.content = content;
        self.out.push(Message::Assistant(message));
    }

    fn tool_result(&mut self, result: &ToolResultMessage) {
        let Some(id) = self.call_ids.get(&result.tool_call_id).cloned() else {
            tracing::debug!(tool_call_id = %result.tool_call_id, "dropping result for a call that is not replayed");
            return;
        };
        self.answered.insert(id.clone());
        self.out.push(Message::ToolResult(ToolResultMessage {
            tool_call_id: id,
            tool_name: result.tool_name.clone(),
            content: self.filter_images(&result.content),
            is_error: result.is_error,
            timestamp: result.timestamp,
        }));
    }

    fn rewrite(mut self, messages: &[Message]) -> Vec<Message> {
        for message in messages {
            match message {
                Message::User(user) => {
                    self.flush_missing_results(user.timestamp);
                    let content = self.filter_images(&user.content);
                    if !content.is_empty() {
                        let mut user = user.clone();
                        user.content = content;
                        self.out.push(Message::User(user));
                    }
                }
                Message::Assistant(assistant) => self.assistant(assistant),
                Message::ToolResult(result) => self.tool_result(result),
            }
        }
        self.out
    }
}

/// Prepare `messages` for a request to `target`.
///
/// Blocks from a different backend lose their opaque signatures, and their
/// reasoning is downgraded to `<thinking>`-wrapped text. Failed assistant
/// turns replay only their text. Images are dropped for models without
/// vision. Results for calls that are not replayed are dropped, and calls
/// left unanswered before the next turn get a synthetic error result.
#[must_use]
pub fn transform_messages(messages: &[Message], target: &Model) -> Vec<Message> {
    Rewriter::new(target, messages.len()).rewrite(messages)
}
