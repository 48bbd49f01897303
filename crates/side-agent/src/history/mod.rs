//! Versioned chat history.
//!
//! An append-only ordered sequence of messages owned by one subflow.
//! Appends are validated (a tool result must bind to a preceding assistant
//! tool call) and counted; nothing here ever reorders, and only the
//! manager ([`manage`]) drops messages.

pub mod manage;

pub use manage::{ManageOptions, manage, manage_with};

use side::{ChatMessage, ContextTag};
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HistoryError {
    #[error("tool result {tool_call_id} has no matching assistant tool call")]
    OrphanToolResult { tool_call_id: String },
}

/// Ordered message sequence for one subflow.
///
/// The tag gate reproduces the pre-tagging format: with the gate off,
/// appended messages are stored untagged, so older histories replay with
/// retention seeing exactly what they saw when recorded.
pub struct ChatHistory {
    workspace_id: String,
    messages: Vec<ChatMessage>,
    append_counter: u64,
    tag_gate: bool,
}

impl ChatHistory {
    pub fn new(workspace_id: impl Into<String>, tag_gate: bool) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            messages: Vec::new(),
            append_counter: 0,
            tag_gate,
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Validated append. Tool results must refer to a tool call that some
    /// preceding assistant message issued.
    pub fn append(&mut self, mut message: ChatMessage) -> Result<(), HistoryError> {
        if let Some(id) = &message.tool_call_id {
            let known = self
                .messages
                .iter()
                .any(|m| m.tool_calls.iter().any(|c| &c.id == id));
            if !known {
                return Err(HistoryError::OrphanToolResult {
                    tool_call_id: id.clone(),
                });
            }
        }
        if !self.tag_gate {
            message.context_tag = None;
        }
        self.messages.push(message);
        self.append_counter += 1;
        Ok(())
    }

    /// Append with a tag applied when the gate allows it.
    pub fn append_tagged(
        &mut self,
        message: ChatMessage,
        tag: ContextTag,
    ) -> Result<(), HistoryError> {
        self.append(message.with_tag(tag))
    }

    /// Current ordered snapshot.
    pub fn items(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn append_count(&self) -> u64 {
        self.append_counter
    }

    /// Replace the live sequence with a managed one. The append counter
    /// keeps counting; drops are not un-appends.
    pub fn replace(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
    }

    pub fn total_chars(&self) -> usize {
        self.messages.iter().map(ChatMessage::char_len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use side::{ChatRole, ToolCall};

    #[test]
    fn append_counts_monotonically() {
        let mut history = ChatHistory::new("ws1", true);
        history.append(ChatMessage::system("rules")).unwrap();
        history.append(ChatMessage::user("task")).unwrap();
        assert_eq!(history.append_count(), 2);
        assert_eq!(history.len(), 2);
        history.replace(vec![]);
        assert_eq!(history.append_count(), 2);
    }

    #[test]
    fn rejects_orphan_tool_results() {
        let mut history = ChatHistory::new("ws1", true);
        let err = history
            .append(ChatMessage::tool_result("missing", "search", "out"))
            .unwrap_err();
        assert!(matches!(
            err,
            HistoryError::OrphanToolResult { tool_call_id } if tool_call_id == "missing"
        ));
    }

    #[test]
    fn accepts_bound_tool_results() {
        let mut history = ChatHistory::new("ws1", true);
        history
            .append(
                ChatMessage::assistant("").with_tool_calls(vec![ToolCall::new(
                    "c1",
                    "bulk_read_file",
                    "{}",
                )]),
            )
            .unwrap();
        history
            .append(ChatMessage::tool_result("c1", "bulk_read_file", "contents"))
            .unwrap();
        assert_eq!(history.last().unwrap().role, ChatRole::Tool);
    }

    #[test]
    fn tag_gate_off_strips_tags() {
        let mut history = ChatHistory::new("ws1", false);
        history
            .append_tagged(ChatMessage::user("feedback"), ContextTag::UserFeedback)
            .unwrap();
        assert_eq!(history.last().unwrap().context_tag, None);

        let mut gated = ChatHistory::new("ws1", true);
        gated
            .append_tagged(ChatMessage::user("feedback"), ContextTag::UserFeedback)
            .unwrap();
        assert_eq!(
            gated.last().unwrap().context_tag,
            Some(ContextTag::UserFeedback)
        );
    }
}
