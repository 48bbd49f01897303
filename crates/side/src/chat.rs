//! Chat message model.
//!
//! Messages are append-only values owned by exactly one history. The
//! character-length accounting used by the history manager lives here
//! (`ChatMessage::char_len`) so every caller counts the same way: text
//! content plus the raw argument blobs of any tool calls.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System instructions.
    System,
    /// The human (or the flow acting on the human's behalf).
    User,
    /// The model.
    Assistant,
    /// A tool result bound to a prior assistant tool call.
    Tool,
}

/// One block of rich message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// Base64-encoded image payload for vision-capable models.
    Image {
        media_type: String,
        data: String,
    },
}

/// Message content: either a plain string or a list of content parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Character count of the textual content. Image parts count zero;
    /// their payloads are never subject to the text budget.
    pub fn len_chars(&self) -> usize {
        match self {
            MessageContent::Text(s) => s.chars().count(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.chars().count(),
                    ContentPart::Image { .. } => 0,
                })
                .sum(),
        }
    }

    /// Flattened text view, joining text parts with newlines.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

/// A structured request from the model to invoke a named function.
///
/// `arguments` is the raw JSON blob as produced by the model; it is parsed
/// leniently at dispatch time, never here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// Per-message cache-control marker understood by the provider layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheHint {
    Ephemeral,
}

/// Retention tag attached at append time and consumed by the history
/// manager's retention rules. Untagged messages carry `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextTag {
    InitialInstructions,
    UserFeedback,
    TestResult,
    EditBlockReport,
    SelfReviewFeedback,
    Summary,
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[serde(default)]
    pub content: MessageContent,
    /// Tool invocations requested by an assistant message, in issue order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set iff `role == Tool`; refers to a preceding assistant tool call id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Function name for tool results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_hint: Option<CacheHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_tag: Option<ContextTag>,
}

impl ChatMessage {
    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::bare(ChatRole::System, content)
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::bare(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::bare(ChatRole::Assistant, content)
    }

    /// A tool-result message bound to `tool_call_id`.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<MessageContent>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Self::bare(ChatRole::Tool, content)
        }
    }

    fn bare(role: ChatRole, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            is_error: false,
            cache_hint: None,
            context_tag: None,
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_tag(mut self, tag: ContextTag) -> Self {
        self.context_tag = Some(tag);
        self
    }

    pub fn with_error(mut self, is_error: bool) -> Self {
        self.is_error = is_error;
        self
    }

    /// Budget length: text content plus the raw argument blobs of tool calls.
    pub fn char_len(&self) -> usize {
        self.content.len_chars()
            + self
                .tool_calls
                .iter()
                .map(|c| c.arguments.chars().count())
                .sum::<usize>()
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == ChatRole::Tool && self.tool_call_id.is_some()
    }
}

/// Wire form of a callable tool handed to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments object.
    pub parameters: Value,
}
