//! Flow runtime: the durable-execution contract, expressed natively.
//!
//! A flow is one logical task whose control flow is deterministic given
//! the answers of its collaborators. Side effects live behind the
//! collaborator traits; signals travel over channels; behavior changes are
//! fenced by named [`Gates`] fixed at flow start, so re-running an old
//! flow with its recorded gate set follows the old code path.

pub mod global_state;

pub use global_state::GlobalState;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::collab::FlowPersistence;
use crate::error::AgentError;
use crate::event_bus::EventBus;
use crate::events::{CloseReason, FlowEventKind};
use crate::interaction::UserLink;

/// Gate labels used by the current engine.
pub mod gates {
    /// Retry transient provider failures with a user-continue prompt.
    pub const LLM_RETRY: &str = "llm-retry";
    /// Extend the refine budget by the signatures-edit hint length.
    pub const REFINE_HINT_BUDGET: &str = "refine-hint-budget";
    /// Tag appended messages with a context tag (history v2).
    pub const HISTORY_TAGS: &str = "history-tags";
    /// Surface activity failures as "try again?" user requests.
    pub const USER_RETRY: &str = "user-retry";
    /// Cache hints at ranked block starts beyond the two endpoints.
    /// Off pending validation.
    pub const EXTRA_CACHE_HINTS: &str = "extra-cache-hints";
}

/// Named version gates, fixed for the lifetime of a flow.
///
/// A gate absent from the map takes its latest-behavior default; flows
/// recorded under older behavior carry explicit `false` entries.
#[derive(Debug, Clone, Default)]
pub struct Gates {
    overrides: HashMap<String, bool>,
}

impl Gates {
    /// Latest behavior for every gate except those off by design.
    pub fn latest() -> Self {
        let mut gates = Self::default();
        gates.overrides.insert(gates::EXTRA_CACHE_HINTS.into(), false);
        gates
    }

    pub fn with(mut self, name: &str, enabled: bool) -> Self {
        self.overrides.insert(name.to_string(), enabled);
        self
    }

    pub fn enabled(&self, name: &str) -> bool {
        self.overrides.get(name).copied().unwrap_or(true)
    }
}

/// Lifecycle of a tracked action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Started,
    Completed,
    Failed,
}

/// One externally observable step within a subflow, persisted through the
/// [`FlowPersistence`] collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowAction {
    pub id: String,
    pub flow_id: String,
    pub action_type: String,
    pub action_params: Value,
    pub action_status: ActionStatus,
}

/// Closure notification sent to the parent when a flow terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowClosed {
    pub flow_id: String,
    pub reason: CloseReason,
}

/// Everything a running flow carries: identity, state hub, event bus,
/// user link, gates, persistence, and the cancellation root.
pub struct FlowContext {
    pub flow_id: String,
    pub workspace_id: String,
    pub state: Arc<GlobalState>,
    pub bus: Arc<EventBus>,
    pub user: Arc<UserLink>,
    pub gates: Gates,
    pub persistence: Arc<dyn FlowPersistence>,
    closed_tx: tokio::sync::mpsc::Sender<FlowClosed>,
    cancel: CancellationToken,
}

impl FlowContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flow_id: impl Into<String>,
        workspace_id: impl Into<String>,
        state: Arc<GlobalState>,
        bus: Arc<EventBus>,
        user: Arc<UserLink>,
        gates: Gates,
        persistence: Arc<dyn FlowPersistence>,
        closed_tx: tokio::sync::mpsc::Sender<FlowClosed>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            workspace_id: workspace_id.into(),
            state,
            bus,
            user,
            gates,
            persistence,
            closed_tx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Hard-cancel the flow. Cooperative: in-flight provider calls observe
    /// the token; queued cancel functions run FIFO.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.state.cancel();
    }

    /// A child cancel scope that fires on pause as well as on hard cancel.
    /// The returned token is registered with the state's cancel queue so a
    /// pause can interrupt the scope without cancelling the whole flow.
    pub fn cancel_on_pause_scope(&self) -> CancellationToken {
        let child = self.cancel.child_token();
        let handle = child.clone();
        self.state.add_cancel_fn(move || handle.cancel());
        child
    }

    /// Deliver the closure signal to the parent. Deliberately independent
    /// of the cancellation token: a cancelled flow still reports
    /// `Canceled` to its parent.
    pub async fn close(&self, reason: CloseReason) {
        self.state.clear_dev_runs();
        self.bus
            .publish(&self.flow_id, FlowEventKind::FlowClosed { reason });
        let _ = self
            .closed_tx
            .send(FlowClosed {
                flow_id: self.flow_id.clone(),
                reason,
            })
            .await;
    }

    /// Run `op` as a tracked action: persist pending → started, run,
    /// persist completed/failed, publishing each transition.
    pub async fn track_action<T, F>(
        &self,
        action_type: &str,
        params: Value,
        op: F,
    ) -> Result<T, AgentError>
    where
        F: std::future::Future<Output = Result<T, AgentError>>,
    {
        let mut action = FlowAction {
            id: uuid::Uuid::now_v7().to_string(),
            flow_id: self.flow_id.clone(),
            action_type: action_type.to_string(),
            action_params: params,
            action_status: ActionStatus::Pending,
        };
        self.persist_action(&mut action, ActionStatus::Pending, true)
            .await;
        self.persist_action(&mut action, ActionStatus::Started, false)
            .await;

        match op.await {
            Ok(value) => {
                self.persist_action(&mut action, ActionStatus::Completed, false)
                    .await;
                Ok(value)
            }
            Err(err) => {
                self.persist_action(&mut action, ActionStatus::Failed, false)
                    .await;
                Err(err)
            }
        }
    }

    async fn persist_action(&self, action: &mut FlowAction, status: ActionStatus, create: bool) {
        action.action_status = status;
        let result = if create {
            self.persistence.create_flow_action(action).await
        } else {
            self.persistence.update_flow_action(action).await
        };
        if let Err(err) = result {
            // Action tracking is observability, not control flow.
            log::warn!(
                "flow {}: failed to persist action {} ({:?}): {}",
                self.flow_id,
                action.action_type,
                status,
                err
            );
        }
        self.bus.publish(
            &self.flow_id,
            FlowEventKind::FlowActionChanged {
                action: action.clone(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::user_link;
    use crate::test_support::RecordingPersistence;
    use serde_json::json;

    fn test_context() -> (
        FlowContext,
        Arc<RecordingPersistence>,
        tokio::sync::mpsc::Receiver<FlowClosed>,
    ) {
        let (user, _remote) = user_link(8);
        let (closed_tx, closed_rx) = tokio::sync::mpsc::channel(1);
        let persistence = Arc::new(RecordingPersistence::default());
        let ctx = FlowContext::new(
            "flow-1",
            "ws-1",
            Arc::new(GlobalState::new()),
            Arc::new(EventBus::new()),
            Arc::new(user),
            Gates::latest(),
            persistence.clone(),
            closed_tx,
        );
        (ctx, persistence, closed_rx)
    }

    #[test]
    fn gates_default_on_except_extra_cache_hints() {
        let gates = Gates::latest();
        assert!(gates.enabled(gates::LLM_RETRY));
        assert!(gates.enabled(gates::HISTORY_TAGS));
        assert!(!gates.enabled(gates::EXTRA_CACHE_HINTS));
        let old = gates.with(gates::LLM_RETRY, false);
        assert!(!old.enabled(gates::LLM_RETRY));
    }

    #[tokio::test]
    async fn track_action_records_full_lifecycle() {
        let (ctx, persistence, _closed) = test_context();
        let value = ctx
            .track_action("build_plan", json!({"step": 1}), async { Ok::<_, AgentError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(
            persistence.statuses(),
            vec![
                ActionStatus::Pending,
                ActionStatus::Started,
                ActionStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn track_action_marks_failures() {
        let (ctx, persistence, _closed) = test_context();
        let err = ctx
            .track_action("apply_edits", json!({}), async {
                Err::<(), _>(AgentError::NonRecoverable("disk".into()))
            })
            .await
            .unwrap_err();
        assert!(!err.is_recoverable());
        assert_eq!(persistence.statuses().last(), Some(&ActionStatus::Failed));
    }

    #[tokio::test]
    async fn close_reports_even_after_cancel() {
        let (ctx, _persistence, mut closed_rx) = test_context();
        ctx.cancel();
        ctx.close(CloseReason::Canceled).await;
        let closed = closed_rx.recv().await.unwrap();
        assert_eq!(closed.reason, CloseReason::Canceled);
        assert!(ctx.state.dev_runs().is_empty());
    }

    #[tokio::test]
    async fn pause_scope_cancels_child_not_root() {
        let (ctx, _persistence, _closed) = test_context();
        let scope = ctx.cancel_on_pause_scope();
        assert!(!scope.is_cancelled());
        // Pause drains the cancel queue, firing the scope token only.
        ctx.state.cancel();
        assert!(scope.is_cancelled());
        assert!(!ctx.cancel_token().is_cancelled());
    }
}
