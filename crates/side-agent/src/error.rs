//! Engine error taxonomy.
//!
//! The split that matters everywhere: recoverable conditions are fed back
//! into the running loop as messages and never escape it; fatal conditions
//! abort the subflow, which reports failure through the closure signal.

use thiserror::Error;

/// Errors surfaced by the engine's loops and flows.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    /// The model emitted arguments that survive neither parsing nor repair.
    /// Recovered locally: an error tool result with a schema hint.
    #[error("malformed tool arguments for {tool}: {reason}")]
    ToolCallUnmarshal { tool: String, reason: String },

    /// A collaborator returned a structured failure. Recovered locally.
    #[error("tool execution failed ({tool}): {reason}")]
    ToolExecFailure { tool: String, reason: String },

    /// Tool output exceeded the active budget. Recovered by shrinking or
    /// summarizing and asking the model to narrow its request.
    #[error("tool result oversize: {chars} chars against budget {budget}")]
    OversizeResult { chars: usize, budget: usize },

    /// The user denied an approval. Recovered: rejection content becomes
    /// feedback and the loop continues.
    #[error("user rejected: {content}")]
    UserRejected { content: String },

    /// A queued user action took precedence over a retry. Sentinel; the
    /// enclosing loop consumes it.
    #[error("pending user action: {action}")]
    PendingUserAction { action: String },

    /// Cooperative pause. Not a failure; the iteration restarts.
    #[error("operation paused")]
    OperationPaused,

    /// Hard iteration ceiling. Fatal for the subflow.
    #[error("max attempts exceeded ({attempts})")]
    MaxAttemptsExceeded { attempts: usize },

    /// I/O failure, irrecoverable parse error, or gate mismatch. Fatal.
    #[error("non-recoverable: {0}")]
    NonRecoverable(String),

    #[error("provider error: {0}")]
    Provider(#[from] side::ProviderError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AgentError {
    /// Whether the enclosing loop may absorb this error and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AgentError::ToolCallUnmarshal { .. }
                | AgentError::ToolExecFailure { .. }
                | AgentError::OversizeResult { .. }
                | AgentError::UserRejected { .. }
                | AgentError::PendingUserAction { .. }
                | AgentError::OperationPaused
        )
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::NonRecoverable(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::NonRecoverable(format!("serialization: {e}"))
    }
}
