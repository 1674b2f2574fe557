use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::agent::AgentState;
use crate::approval::ApprovalRequest;
use crate::events;

// ── ChatEmitter trait ────────────────────────────────────────────

/// Abstraction over progress reporting so the agent loop runs headless.
pub trait ChatEmitter: Send + Sync {
    fn emit_state(&self, state: AgentState);
    fn emit_token(&self, text: &str);
    fn emit_tool_call(&self, tool: &str, input: &Value);
    fn emit_tool_result(&self, tool: &str, result: &str, is_error: bool);
    fn emit_approval(&self, request: &ApprovalRequest);
    fn emit_complete(&self, truncated: bool);
    fn emit_error(&self, message: &str);
}

/// Drops every event. The loop still returns its outcome.
pub struct NoopChatEmitter;

impl ChatEmitter for NoopChatEmitter {
    fn emit_state(&self, _state: AgentState) {}
    fn emit_token(&self, _text: &str) {}
    fn emit_tool_call(&self, _tool: &str, _input: &Value) {}
    fn emit_tool_result(&self, _tool: &str, _result: &str, _is_error: bool) {}
    fn emit_approval(&self, _request: &ApprovalRequest) {}
    fn emit_complete(&self, _truncated: bool) {}
    fn emit_error(&self, _message: &str) {}
}

/// Agent progress as data, for hosts that forward events to a UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum AgentEvent {
    #[serde(rename = "chat:state")]
    State(AgentState),
    #[serde(rename = "chat:token")]
    Token(String),
    #[serde(rename = "chat:tool_call")]
    ToolCall { tool: String, input: Value },
    #[serde(rename = "chat:tool_result")]
    ToolResult {
        tool: String,
        result: String,
        is_error: bool,
    },
    #[serde(rename = "chat:approval")]
    Approval(ApprovalRequest),
    #[serde(rename = "chat:complete")]
    Complete { truncated: bool },
    #[serde(rename = "chat:error")]
    Error(String),
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::State(_) => events::CHAT_STATE,
            Self::Token(_) => events::CHAT_TOKEN,
            Self::ToolCall { .. } => events::CHAT_TOOL_CALL,
            Self::ToolResult { .. } => events::CHAT_TOOL_RESULT,
            Self::Approval(_) => events::CHAT_APPROVAL,
            Self::Complete { .. } => events::CHAT_COMPLETE,
            Self::Error(_) => events::CHAT_ERROR,
        }
    }
}

/// Forwards every emission as an [`AgentEvent`] on an unbounded channel.
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: AgentEvent) {
        // A closed receiver just means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl ChatEmitter for ChannelEmitter {
    fn emit_state(&self, state: AgentState) {
        self.send(AgentEvent::State(state));
    }
    fn emit_token(&self, text: &str) {
        self.send(AgentEvent::Token(text.to_string()));
    }
    fn emit_tool_call(&self, tool: &str, input: &Value) {
        self.send(AgentEvent::ToolCall {
            tool: tool.to_string(),
            input: input.clone(),
        });
    }
    fn emit_tool_result(&self, tool: &str, result: &str, is_error: bool) {
        self.send(AgentEvent::ToolResult {
            tool: tool.to_string(),
            result: result.to_string(),
            is_error,
        });
    }
    fn emit_approval(&self, request: &ApprovalRequest) {
        self.send(AgentEvent::Approval(request.clone()));
    }
    fn emit_complete(&self, truncated: bool) {
        self.send(AgentEvent::Complete { truncated });
    }
    fn emit_error(&self, message: &str) {
        self.send(AgentEvent::Error(message.to_string()));
    }
}

// ── Types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: ChatContent,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: ChatContent::Text(text.into()),
        }
    }

    pub fn assistant(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: ChatContent::Blocks(blocks),
        }
    }

    /// Tool results travel back to the model in a user-role message.
    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: "user".to_string(),
            content: ChatContent::Blocks(blocks),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "is_false")]
        is_error: bool,
    },
}

/// A tool invocation proposed by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// One model turn, normalized to content blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub blocks: Vec<ContentBlock>,
    pub stop_reason: String,
}

impl ModelResponse {
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatHistoryEntry {
    pub role: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

// ── Conversation ─────────────────────────────────────────────────

/// Message history for one agent conversation.
#[derive(Debug, Default)]
pub struct Conversation {
    pub id: String,
    history: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            history: Vec::new(),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.history.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn history_for_display(&self) -> Vec<ChatHistoryEntry> {
        let mut entries = Vec::new();
        for msg in &self.history {
            match &msg.content {
                ChatContent::Text(text) => entries.push(ChatHistoryEntry {
                    role: msg.role.clone(),
                    text: text.clone(),
                    tool_name: None,
                }),
                ChatContent::Blocks(blocks) => {
                    for block in blocks {
                        entries.push(match block {
                            ContentBlock::Text { text } => ChatHistoryEntry {
                                role: msg.role.clone(),
                                text: text.clone(),
                                tool_name: None,
                            },
                            ContentBlock::ToolUse { name, .. } => ChatHistoryEntry {
                                role: "assistant".to_string(),
                                text: format!("Calling {name}..."),
                                tool_name: Some(name.clone()),
                            },
                            ContentBlock::ToolResult {
                                content, is_error, ..
                            } => ChatHistoryEntry {
                                role: "tool".to_string(),
                                text: if *is_error {
                                    format!("Error: {content}")
                                } else {
                                    content.clone()
                                },
                                tool_name: None,
                            },
                        });
                    }
                }
            }
        }
        entries
    }

    /// The last assistant text response, for CLI output.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.history
            .iter()
            .rev()
            .filter(|m| m.role == "assistant")
            .find_map(|m| match &m.content {
                ChatContent::Text(text) => Some(text.clone()),
                ChatContent::Blocks(blocks) => blocks.iter().find_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.clone()),
                    _ => None,
                }),
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn tool_result_serializes_error_flag_only_when_set() {
        let ok = ContentBlock::ToolResult {
            tool_use_id: "t1".into(),
            content: "done".into(),
            is_error: false,
        };
        let failed = ContentBlock::ToolResult {
            tool_use_id: "t2".into(),
            content: "bad".into(),
            is_error: true,
        };
        let ok_json = serde_json::to_value(&ok).unwrap();
        assert_eq!(ok_json["type"], "tool_result");
        assert!(ok_json.get("is_error").is_none());
        assert_eq!(serde_json::to_value(&failed).unwrap()["is_error"], true);
    }

    #[test]
    fn response_splits_text_and_tool_calls() {
        let response = ModelResponse {
            blocks: vec![
                ContentBlock::Text { text: "Moving it.".into() },
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "set_transform".into(),
                    input: json!({ "entityId": "e1" }),
                },
            ],
            stop_reason: "tool_use".into(),
        };
        assert_eq!(response.text(), "Moving it.");
        let calls = response.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "set_transform");
    }

    #[test]
    fn display_history_marks_errors() {
        let mut conv = Conversation::new("c1");
        conv.push(ChatMessage::user("hi"));
        conv.push(ChatMessage::assistant(vec![ContentBlock::Text { text: "hello".into() }]));
        conv.push(ChatMessage::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: "t".into(),
            content: "nope".into(),
            is_error: true,
        }]));
        let entries = conv.history_for_display();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].text, "Error: nope");
        assert_eq!(conv.last_assistant_text().as_deref(), Some("hello"));
    }

    #[test]
    fn agent_events_carry_their_names() {
        let (emitter, mut rx) = ChannelEmitter::new();
        emitter.emit_tool_result("undo", "Nothing to undo", true);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.name(), events::CHAT_TOOL_RESULT);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "chat:tool_result");
        assert_eq!(json["data"]["is_error"], true);
    }
}
