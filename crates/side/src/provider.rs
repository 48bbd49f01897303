//! LLM provider abstraction.
//!
//! The engine obtains completions through [`ChatProvider`] and never talks
//! to a concrete backend. Implementations must honour the cancellation
//! token: a call observed to be cancelled returns
//! [`ProviderError::Cancelled`] instead of a partial completion.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::chat::{ChatMessage, ToolDefinition};

/// Token usage for one completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A finished completion: the assistant message plus usage when reported.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub message: ChatMessage,
    pub usage: Option<Usage>,
}

impl ChatCompletion {
    pub fn new(message: ChatMessage) -> Self {
        Self {
            message,
            usage: None,
        }
    }
}

/// Provider failures, split by how the loop may react.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ProviderError {
    #[error("call cancelled")]
    Cancelled,

    #[error("rate limited: retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("bad response: {0}")]
    Response(String),
}

impl ProviderError {
    /// Whether the loop may retry this failure (behind its retry gate).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Timeout
                | ProviderError::Transport(_)
        )
    }
}

/// A chat completion backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// One completion over the given messages and available tools.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<ChatCompletion, ProviderError>;
}

/// Scripted provider for tests.
///
/// Responses are drained in push order; an exhausted script returns a
/// `Response` error so a runaway loop fails loudly. Delays make a call
/// interruptible; a cancelled call discards its scripted entry, the way a
/// real partial generation is thrown away.
#[derive(Default)]
pub struct MockProvider {
    script: Mutex<VecDeque<Result<ChatCompletion, ProviderError>>>,
    seen_message_counts: Mutex<Vec<usize>>,
    delay: Option<Duration>,
    one_shot_delays: Mutex<VecDeque<Duration>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Delay only the next call (consumed in push order).
    pub fn delay_next(&self, delay: Duration) {
        self.one_shot_delays.lock().push_back(delay);
    }

    pub fn push(&self, completion: ChatCompletion) {
        self.script.lock().push_back(Ok(completion));
    }

    pub fn push_message(&self, message: ChatMessage) {
        self.push(ChatCompletion::new(message));
    }

    pub fn push_error(&self, error: ProviderError) {
        self.script.lock().push_back(Err(error));
    }

    /// Message counts of every call received so far.
    pub fn seen_message_counts(&self) -> Vec<usize> {
        self.seen_message_counts.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen_message_counts.lock().len()
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<ChatCompletion, ProviderError> {
        self.seen_message_counts.lock().push(messages.len());

        // The entry is taken up front: a cancelled call discards it.
        let next = self.script.lock().pop_front();

        let delay = self.one_shot_delays.lock().pop_front().or(self.delay);
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            }
        } else if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        next.unwrap_or_else(|| Err(ProviderError::Response("mock script exhausted".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_drains_script_in_order() {
        let provider = MockProvider::new();
        provider.push_message(ChatMessage::assistant("one"));
        provider.push_message(ChatMessage::assistant("two"));

        let cancel = CancellationToken::new();
        let a = provider.complete(&[], &[], &cancel).await.unwrap();
        let b = provider.complete(&[], &[], &cancel).await.unwrap();
        assert_eq!(a.message.content.as_text(), "one");
        assert_eq!(b.message.content.as_text(), "two");
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn mock_errors_when_exhausted() {
        let provider = MockProvider::new();
        let cancel = CancellationToken::new();
        let err = provider.complete(&[], &[], &cancel).await.unwrap_err();
        assert!(matches!(err, ProviderError::Response(_)));
    }

    #[tokio::test]
    async fn delayed_call_is_cancellable() {
        let provider = MockProvider::new().with_delay(Duration::from_secs(30));
        provider.push_message(ChatMessage::assistant("never delivered"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = provider.complete(&[], &[], &cancel).await.unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }

    #[test]
    fn retryable_split() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProviderError::Transport("reset".into()).is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
        assert!(!ProviderError::Response("bad".into()).is_retryable());
    }
}
