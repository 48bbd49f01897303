//! The generic iterative LLM driver.
//!
//! Each iteration: pause check, history management, auto-iteration guard,
//! one provider call inside a cancel-on-pause scope, tool dispatch, then
//! the caller's iteration function decides whether the loop is done. The
//! provider call is the only long-blocking operation per iteration; every
//! other wait is an explicit user request.

use std::sync::Arc;

use side::{ChatMessage, ChatProvider, ContextTag, ProviderError, ToolDefinition};

use crate::collab::{RepoSearcher, SymbolRetriever, WorkspaceFiles};
use crate::error::AgentError;
use crate::flow::{FlowContext, gates};
use crate::history::{ChatHistory, manage};
use crate::interaction::{RequestForUser, RequestKind};
use crate::tools::{
    ToolContext, ToolOverrides, ToolRegistry, ToolResponse, dispatch_tool_calls, response_message,
};

/// Default hard ceiling on iterations.
const DEFAULT_MAX_ATTEMPTS: u32 = 17;

/// Optional tag applied to a tool result before it is appended.
pub type ResultTagger = fn(&ToolResponse) -> Option<ContextTag>;

#[derive(Clone)]
pub struct LoopOptions {
    /// Name of the subflow, used for user requests and logging.
    pub subflow: String,
    /// Soft character budget handed to the history manager.
    pub soft_limit_chars: usize,
    /// Force a user check-in after this many auto-iterations.
    pub feedback_every: Option<u32>,
    /// Hard iteration ceiling.
    pub max_attempts: u32,
    /// Tool definitions offered to the provider; the registry's full set
    /// when absent.
    pub tool_definitions: Option<Vec<ToolDefinition>>,
    /// Per-iteration definition override; wins over `tool_definitions`.
    /// This is how a specialized loop forces particular tools per turn.
    pub definitions_for: Option<fn(&LoopState) -> Vec<ToolDefinition>>,
    /// Context tag for appended tool results.
    pub result_tag: Option<ResultTagger>,
}

impl LoopOptions {
    pub fn new(subflow: impl Into<String>, soft_limit_chars: usize) -> Self {
        Self {
            subflow: subflow.into(),
            soft_limit_chars,
            feedback_every: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            tool_definitions: None,
            definitions_for: None,
            result_tag: None,
        }
    }

    pub fn with_feedback_every(mut self, n: u32) -> Self {
        self.feedback_every = Some(n);
        self
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }
}

/// Per-run mutable loop state, threaded through the iteration function.
#[derive(Debug, Default)]
pub struct LoopState {
    pub iteration: u32,
    /// Iterations since the user was last involved.
    pub auto_iteration: u32,
    /// Cumulative tool-result overflow; extends the soft limit so a result
    /// the loop chose to keep is not immediately pruned away.
    pub overflow_chars: usize,
    /// Messages the iteration function wants appended before the next
    /// turn (e.g. a narrow-your-request directive).
    pub pending_feedback: Vec<ChatMessage>,
}

/// The loop's collaborators, shared across subflows of one flow.
#[derive(Clone)]
pub struct LoopHarness {
    pub flow: Arc<FlowContext>,
    pub provider: Arc<dyn ChatProvider>,
    pub registry: ToolRegistry,
    pub overrides: ToolOverrides,
    pub files: Arc<dyn WorkspaceFiles>,
    pub symbols: Arc<dyn SymbolRetriever>,
    pub search: Arc<dyn RepoSearcher>,
}

impl LoopHarness {
    fn tool_context(&self) -> ToolContext {
        ToolContext {
            flow_id: self.flow.flow_id.clone(),
            state: self.flow.state.clone(),
            user: self.flow.user.clone(),
            files: self.files.clone(),
            symbols: self.symbols.clone(),
            search: self.search.clone(),
            cancel: self.flow.cancel_token().clone(),
        }
    }

    /// Drive the loop until the iteration function produces a value.
    ///
    /// `on_iteration` sees the assistant message and the tool responses of
    /// the turn; returning `Some` ends the loop with that value.
    #[tracing::instrument(
        name = "agent.llm_loop",
        skip_all,
        fields(flow_id = %self.flow.flow_id, subflow = %options.subflow)
    )]
    pub async fn run<T, F>(
        &self,
        history: &mut ChatHistory,
        options: LoopOptions,
        mut on_iteration: F,
    ) -> Result<T, AgentError>
    where
        F: FnMut(&ChatMessage, &[ToolResponse], &mut LoopState) -> Option<T>,
    {
        let mut state = LoopState::default();
        let base_definitions = options
            .tool_definitions
            .clone()
            .unwrap_or_else(|| self.registry.definitions());

        loop {
            if self.flow.cancel_token().is_cancelled() {
                return Err(AgentError::NonRecoverable("flow cancelled".into()));
            }

            // 1. Pause check. A paused flow asks the user for guidance and
            //    turns any answer into feedback before re-entering.
            if self.flow.state.is_paused() {
                self.pause_guidance(history, &options, &mut state).await?;
                continue;
            }

            // 2. History management, soft limit extended by tracked
            //    overflow.
            let managed = manage(
                history.items(),
                options.soft_limit_chars + state.overflow_chars,
            );
            history.replace(managed);

            // 3. Auto-iteration guard.
            if let Some(every) = options.feedback_every
                && state.auto_iteration >= every
            {
                self.forced_feedback(history, &options, &mut state).await?;
                continue;
            }

            // 4. Provider call inside a cancel-on-pause scope. A pause
            //    mid-call discards the partial turn and re-enters at the
            //    pause check.
            let definitions = match options.definitions_for {
                Some(f) => f(&state),
                None => base_definitions.clone(),
            };
            let scope = self.flow.cancel_on_pause_scope();
            let completion = self
                .provider
                .complete(history.items(), &definitions, &scope)
                .await;

            let completion = match completion {
                Ok(c) => c,
                Err(ProviderError::Cancelled) => {
                    if self.flow.state.is_paused() {
                        continue;
                    }
                    return Err(AgentError::NonRecoverable("flow cancelled".into()));
                }
                Err(e) if e.is_retryable() && self.flow.gates.enabled(gates::LLM_RETRY) => {
                    if let Some(action) = self.flow.state.pending_user_action() {
                        // A queued user action outranks a retry.
                        return Err(AgentError::PendingUserAction {
                            action: serde_json::to_string(&action)
                                .unwrap_or_else(|_| "user action".into()),
                        });
                    }
                    self.retry_prompt(&options, &e).await?;
                    state.iteration += 1;
                    if state.iteration >= options.max_attempts {
                        return Err(AgentError::MaxAttemptsExceeded {
                            attempts: state.iteration as usize,
                        });
                    }
                    continue;
                }
                Err(e) => return Err(AgentError::Provider(e)),
            };

            // 5. Append the turn, dispatch its tool calls in order.
            let assistant = completion.message;
            history
                .append(assistant.clone())
                .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;
            state.iteration += 1;
            state.auto_iteration += 1;

            let responses = if assistant.tool_calls.is_empty() {
                Vec::new()
            } else {
                let ctx = self.tool_context();
                dispatch_tool_calls(&assistant.tool_calls, &self.registry, &self.overrides, &ctx)
                    .await
            };
            for response in &responses {
                let mut message = response_message(response);
                if let Some(tagger) = options.result_tag
                    && let Some(tag) = tagger(response)
                {
                    message = message.with_tag(tag);
                }
                history
                    .append(message)
                    .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;
                if response.user_contact {
                    state.auto_iteration = 0;
                }
            }

            if let Some(value) = on_iteration(&assistant, &responses, &mut state) {
                return Ok(value);
            }

            // Feedback the iteration function queued lands before the next
            // turn sees the history.
            for message in state.pending_feedback.drain(..) {
                history
                    .append(message)
                    .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;
            }

            // 6. Hard ceiling.
            if state.iteration >= options.max_attempts {
                return Err(AgentError::MaxAttemptsExceeded {
                    attempts: state.iteration as usize,
                });
            }
        }
    }

    /// Paused: request guidance; a non-empty answer becomes feedback.
    async fn pause_guidance(
        &self,
        history: &mut ChatHistory,
        options: &LoopOptions,
        state: &mut LoopState,
    ) -> Result<(), AgentError> {
        log::info!("{}: paused, requesting guidance", options.subflow);
        let outcome = self
            .flow
            .user
            .request(
                RequestForUser {
                    origin_flow_id: self.flow.flow_id.clone(),
                    flow_action_id: None,
                    content: "The flow is paused. Reply to resume; any guidance you \
                              add will steer the next steps."
                        .to_string(),
                    subflow: options.subflow.clone(),
                    kind: RequestKind::FreeForm,
                    params: Default::default(),
                },
                self.flow.cancel_token(),
            )
            .await
            .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;

        self.flow.state.resume();
        state.auto_iteration = 0;
        if !outcome.content.is_empty() {
            history
                .append(ChatMessage::user(outcome.content).with_tag(ContextTag::UserFeedback))
                .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;
        }
        Ok(())
    }

    /// Too many unattended iterations: check in with the user.
    async fn forced_feedback(
        &self,
        history: &mut ChatHistory,
        options: &LoopOptions,
        state: &mut LoopState,
    ) -> Result<(), AgentError> {
        log::info!(
            "{}: {} auto-iterations, forcing a feedback request",
            options.subflow,
            state.auto_iteration
        );
        let outcome = self
            .flow
            .user
            .request(
                RequestForUser {
                    origin_flow_id: self.flow.flow_id.clone(),
                    flow_action_id: None,
                    content: "Progress check: reply to keep going, or add guidance \
                              to adjust course."
                        .to_string(),
                    subflow: options.subflow.clone(),
                    kind: RequestKind::FreeForm,
                    params: Default::default(),
                },
                self.flow.cancel_token(),
            )
            .await
            .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;

        state.auto_iteration = 0;
        if !outcome.content.is_empty() {
            history
                .append(ChatMessage::user(outcome.content).with_tag(ContextTag::UserFeedback))
                .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;
        }
        Ok(())
    }

    /// Transient provider failure: ask the user whether to try again.
    async fn retry_prompt(&self, options: &LoopOptions, error: &ProviderError) -> Result<(), AgentError> {
        log::warn!("{}: provider error, asking to retry: {error}", options.subflow);
        let outcome = self
            .flow
            .user
            .request(
                RequestForUser {
                    origin_flow_id: self.flow.flow_id.clone(),
                    flow_action_id: None,
                    content: format!("The model call failed ({error}). Reply to try again."),
                    subflow: options.subflow.clone(),
                    kind: RequestKind::Continue,
                    params: Default::default(),
                },
                self.flow.cancel_token(),
            )
            .await
            .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;
        if !outcome.approved {
            return Err(AgentError::UserRejected {
                content: outcome.content,
            });
        }
        Ok(())
    }
}
