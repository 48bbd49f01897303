//! Core types shared by the side agent engine and its embedders.
//!
//! This crate carries no engine logic: it defines the chat message model
//! (roles, content parts, tool calls, context tags, cache hints), the
//! provider abstraction used to obtain completions, and the tolerant JSON
//! repair pass applied to model-produced tool arguments.

pub mod chat;
pub mod json_repair;
pub mod provider;

pub use chat::{
    CacheHint, ChatMessage, ChatRole, ContentPart, ContextTag, MessageContent, ToolCall,
    ToolDefinition,
};
pub use json_repair::{parse_lenient, repair_json};
pub use provider::{ChatCompletion, ChatProvider, MockProvider, ProviderError, Usage};
