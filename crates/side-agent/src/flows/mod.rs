//! Top-level flows: requirements → plan → step execution → merge.
//!
//! Each phase is a subflow tracked as a flow action. The loops do the
//! iterative work; this module sequences them, reacts to user actions and
//! pause signals, and guarantees cleanup plus a closure signal on every
//! exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use side::{ChatMessage, ContextTag};
use tokio::sync::mpsc;

use crate::collab::{CheckKind, CheckRunner};
use crate::config::RepoConfig;
use crate::dev_run::{DevRunSupervisor, StartOptions};
use crate::edit::{EditBlock, apply_edit_blocks, parse_edit_blocks, render_report};
use crate::error::AgentError;
use crate::events::CloseReason;
use crate::flow::{FlowContext, gates};
use crate::history::ChatHistory;
use crate::interaction::{
    PARAM_BASE_BRANCH, PARAM_MERGE_STRATEGY, PARAM_TARGET_BRANCH, RequestForUser, RequestKind,
    UserAction, apply_merge_params,
};
use crate::loops::{CodeContextLoop, LoopHarness, LoopOptions};
use crate::tools::{DevPlan, Requirements};

/// Cycles of author → apply → check per step before the user is asked.
const STEP_ATTEMPTS_BEFORE_ESCALATION: u32 = 3;

/// Signals a running flow reacts to from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowSignal {
    Pause,
    UserAction(UserAction),
}

/// What one plan step ended as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    SkippedByUser,
}

/// Everything the orchestrator needs beyond the loop harness.
pub struct FlowDeps {
    pub harness: LoopHarness,
    pub config: RepoConfig,
    pub checks: Arc<dyn CheckRunner>,
    pub supervisor: Arc<DevRunSupervisor>,
}

pub struct PlanAndExecute {
    deps: FlowDeps,
}

impl PlanAndExecute {
    pub fn new(deps: FlowDeps) -> Self {
        Self { deps }
    }

    fn flow(&self) -> &FlowContext {
        &self.deps.harness.flow
    }

    fn human_in_the_loop(&self) -> bool {
        !self.deps.config.disable_human_in_the_loop
    }

    /// Answer the `dev_run_config` query.
    pub fn dev_run_config(&self) -> crate::config::DevRunConfig {
        self.deps.config.dev_run.clone()
    }

    /// Answer the `dev_run_state` query.
    pub fn dev_run_state(&self) -> HashMap<String, crate::dev_run::DevRunInstance> {
        self.flow().state.dev_runs()
    }

    /// Run the whole pipeline. Never panics out: every exit path stops the
    /// dev runs and delivers the closure signal.
    pub async fn run(&self, task: &str) -> CloseReason {
        let result = self.run_inner(task).await;

        for command_id in self.flow().state.dev_runs().keys().cloned().collect::<Vec<_>>() {
            if let Err(e) = self.deps.supervisor.stop(&command_id, None).await {
                log::warn!("cleanup stop of {command_id} failed: {e}");
            }
        }
        self.deps.supervisor.shutdown_monitors();

        let reason = match result {
            Ok(()) => CloseReason::Completed,
            Err(_) if self.flow().cancel_token().is_cancelled() => CloseReason::Canceled,
            Err(e) => {
                log::error!("flow {} failed: {e}", self.flow().flow_id);
                CloseReason::Failed
            }
        };
        self.flow().close(reason).await;
        reason
    }

    async fn run_inner(&self, task: &str) -> Result<(), AgentError> {
        let flow = self.flow();
        let mut history = ChatHistory::new(
            flow.workspace_id.clone(),
            flow.gates.enabled(gates::HISTORY_TAGS),
        );

        let mut instructions = String::new();
        if let Some(mission) = &self.deps.config.mission {
            instructions.push_str(mission);
            instructions.push_str("\n\n");
        }
        instructions.push_str("Task:\n");
        instructions.push_str(task);
        if let Some(hints) =
            crate::config::edit_hints(Some(&self.deps.config), self.deps.harness.files.root())
        {
            instructions.push_str("\n\nRepository conventions:\n");
            instructions.push_str(&hints);
        }
        history
            .append(ChatMessage::system(instructions).with_tag(ContextTag::InitialInstructions))
            .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;

        // Phase 1: initial code context.
        let context = flow
            .track_action("prepare_code_context", json!({"task": task}), async {
                let ctx_loop = CodeContextLoop::new(self.deps.harness.clone());
                ctx_loop.gather(&mut history).await
            })
            .await?;
        if !context.is_empty() {
            history
                .append(ChatMessage::user(format!("Relevant code context:\n{context}")))
                .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;
        }

        // Phase 2: requirements.
        let requirements = self.build_requirements(&mut history).await?;

        // Name the work branch off the task, falling back to words from
        // the approved requirements. Collision probing against the actual
        // ref store is the git collaborator's concern.
        if flow.state.string_value("source_branch").is_none() {
            let fallback: Vec<String> = requirements
                .overview
                .split_whitespace()
                .map(String::from)
                .collect();
            let branch = crate::branch::branch_name_from_words(task.split_whitespace())
                .and_then(|c| crate::branch::resolve_branch_name(&c, &fallback, |_| false));
            if let Some(branch) = branch {
                flow.state.set_string_value("source_branch", branch);
            }
        }

        // Phase 3: plan.
        let plan = self.build_plan(&mut history, &requirements).await?;

        // Phase 4: execute each step.
        for (index, step) in plan.steps.iter().enumerate() {
            let outcome = flow
                .track_action(
                    "execute_step",
                    json!({"index": index, "title": step.title}),
                    self.execute_step(&mut history, index, step),
                )
                .await?;
            if outcome == StepOutcome::SkippedByUser {
                log::info!("step {index} skipped by user action");
            }
        }

        // Phase 5: merge approval.
        self.merge_approval(&requirements).await?;
        Ok(())
    }

    /// Requirements elicitation with the finalized → approval gate. The
    /// record/update tools run with flow-site overrides only in the sense
    /// that this subflow decides what finalization means: a rejected
    /// approval definalizes and feeds the rejection back.
    async fn build_requirements(
        &self,
        history: &mut ChatHistory,
    ) -> Result<Requirements, AgentError> {
        let flow = self.flow();
        let entry = self.deps.config.agent_entry("build_requirements");
        let max_attempts = self
            .deps
            .config
            .max_planning_iterations
            .unwrap_or(17);

        loop {
            let mut options = LoopOptions::new("build_requirements", 160_000)
                .with_max_attempts(max_attempts);
            if let Some(auto) = entry.auto_iterations {
                options = options.with_feedback_every(auto);
            }
            let state = flow.state.clone();
            let requirements = flow
                .track_action("build_requirements", json!({}), async {
                    self.deps
                        .harness
                        .run(history, options, |_assistant, _responses, _state| {
                            Requirements::load(&state).filter(|r| r.finalized)
                        })
                        .await
                })
                .await?;

            if !self.human_in_the_loop() {
                return Ok(requirements);
            }

            let outcome = flow
                .user
                .request(
                    RequestForUser {
                        origin_flow_id: flow.flow_id.clone(),
                        flow_action_id: None,
                        content: format!(
                            "Requirements are ready for review:\n\n{}",
                            requirements.render()
                        ),
                        subflow: "build_requirements".into(),
                        kind: RequestKind::Approval,
                        params: HashMap::new(),
                    },
                    flow.cancel_token(),
                )
                .await
                .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;

            if outcome.approved {
                return Ok(requirements);
            }

            // Rejection: definalize, feed the content back, stay in the
            // loop.
            let mut reopened = requirements;
            reopened.finalized = false;
            reopened.store(&flow.state);
            history
                .append(
                    ChatMessage::user(format!(
                        "The requirements were not approved: {}",
                        outcome.content
                    ))
                    .with_tag(ContextTag::UserFeedback),
                )
                .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;
        }
    }

    async fn build_plan(
        &self,
        history: &mut ChatHistory,
        requirements: &Requirements,
    ) -> Result<DevPlan, AgentError> {
        let flow = self.flow();
        let entry = self.deps.config.agent_entry("build_plan");
        let max_attempts = self.deps.config.max_planning_iterations.unwrap_or(17);

        history
            .append(ChatMessage::user(format!(
                "Build a step-by-step plan for these requirements:\n\n{}",
                requirements.render()
            )))
            .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;

        loop {
            let mut options =
                LoopOptions::new("build_plan", 160_000).with_max_attempts(max_attempts);
            if let Some(auto) = entry.auto_iterations {
                options = options.with_feedback_every(auto);
            }
            let state = flow.state.clone();
            let plan = flow
                .track_action("build_plan", json!({}), async {
                    self.deps
                        .harness
                        .run(history, options, |_assistant, _responses, _state| {
                            DevPlan::load(&state).filter(|p| p.finalized && !p.steps.is_empty())
                        })
                        .await
                })
                .await?;

            if !self.human_in_the_loop() {
                return Ok(plan);
            }

            let outcome = flow
                .user
                .request(
                    RequestForUser {
                        origin_flow_id: flow.flow_id.clone(),
                        flow_action_id: None,
                        content: format!("The plan is ready for review:\n\n{}", plan.render()),
                        subflow: "build_plan".into(),
                        kind: RequestKind::Approval,
                        params: HashMap::new(),
                    },
                    flow.cancel_token(),
                )
                .await
                .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;

            if outcome.approved {
                return Ok(plan);
            }

            let mut reopened = plan;
            reopened.finalized = false;
            reopened.store(&flow.state);
            history
                .append(
                    ChatMessage::user(format!("The plan was not approved: {}", outcome.content))
                        .with_tag(ContextTag::UserFeedback),
                )
                .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;
        }
    }

    /// One plan step: gather step context, author edits, apply them, run
    /// checks, self-review, iterate. Persistent failure asks the user.
    async fn execute_step(
        &self,
        history: &mut ChatHistory,
        index: usize,
        step: &crate::tools::DevPlanStep,
    ) -> Result<StepOutcome, AgentError> {
        let flow = self.flow();
        history
            .append(ChatMessage::user(format!(
                "Execute step {}: {}\n{}\nPropose the changes as edit blocks.",
                index + 1,
                step.title,
                step.definition
            )))
            .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;

        let mut attempts_since_contact = 0u32;
        loop {
            if let Some(UserAction::GoNextStep) = flow.state.pending_user_action() {
                flow.state.consume_pending_user_action();
                return Ok(StepOutcome::SkippedByUser);
            }

            // Author edits.
            let options = LoopOptions::new("execute_step", 160_000)
                .with_max_attempts(self.deps.config.max_iterations.unwrap_or(17));
            let blocks: Vec<EditBlock> = self
                .deps
                .harness
                .run(history, options, |assistant, _responses, _state| {
                    let blocks = parse_edit_blocks(&assistant.content.as_text());
                    (!blocks.is_empty()).then_some(blocks)
                })
                .await?;

            // Apply and report.
            let entries = apply_edit_blocks(&blocks, self.deps.harness.files.as_ref(), false).await;
            let report = render_report(&entries);
            history
                .append(ChatMessage::user(report.clone()).with_tag(ContextTag::EditBlockReport))
                .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;

            let all_applied = entries.iter().all(|e| e.success);

            // Checks and tests, only worth running on an applied batch.
            let checks_passed = if all_applied {
                self.run_checks(history).await?
            } else {
                false
            };

            if checks_passed && self.self_review(history).await? {
                return Ok(StepOutcome::Completed);
            }

            attempts_since_contact += 1;
            if attempts_since_contact >= STEP_ATTEMPTS_BEFORE_ESCALATION {
                if !self.human_in_the_loop() {
                    return Err(AgentError::MaxAttemptsExceeded {
                        attempts: attempts_since_contact as usize,
                    });
                }
                let outcome = flow
                    .user
                    .request(
                        RequestForUser {
                            origin_flow_id: flow.flow_id.clone(),
                            flow_action_id: None,
                            content: format!(
                                "Step {} keeps failing after {} attempts. Add guidance, \
                                 or reply to let it keep trying.",
                                index + 1,
                                attempts_since_contact
                            ),
                            subflow: "execute_step".into(),
                            kind: RequestKind::FreeForm,
                            params: HashMap::new(),
                        },
                        flow.cancel_token(),
                    )
                    .await
                    .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;
                if !outcome.content.is_empty() {
                    history
                        .append(
                            ChatMessage::user(outcome.content).with_tag(ContextTag::UserFeedback),
                        )
                        .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;
                }
                attempts_since_contact = 0;
            }
        }
    }

    /// Run configured check and test commands; the combined output lands
    /// in history tagged as a test result.
    async fn run_checks(&self, history: &mut ChatHistory) -> Result<bool, AgentError> {
        let mut all_passed = true;
        let mut output = String::new();

        let groups: [(CheckKind, Option<&Vec<String>>); 4] = [
            (CheckKind::Check, self.deps.config.check_commands.as_ref()),
            (CheckKind::Autofix, self.deps.config.autofix_commands.as_ref()),
            (CheckKind::Test, self.deps.config.test_commands.as_ref()),
            (
                CheckKind::IntegrationTest,
                self.deps.config.integration_test_commands.as_ref(),
            ),
        ];
        for (kind, commands) in groups {
            let Some(commands) = commands else { continue };
            for command in commands {
                let outcome = perform_with_user_retry(
                    self.flow(),
                    self.human_in_the_loop(),
                    "run_checks",
                    || async {
                        self.deps
                            .checks
                            .run(kind, command)
                            .await
                            .map_err(|e| AgentError::ToolExecFailure {
                                tool: format!("{kind:?}"),
                                reason: e.to_string(),
                            })
                    },
                )
                .await?;
                if !outcome.success {
                    all_passed = false;
                }
                output.push_str(&format!(
                    "$ {command}\n{}\n[{}]\n",
                    outcome.output,
                    if outcome.success { "passed" } else { "failed" }
                ));
            }
        }

        if !output.is_empty() {
            history
                .append(ChatMessage::user(output).with_tag(ContextTag::TestResult))
                .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;
        }
        Ok(all_passed)
    }

    /// One review turn over the applied changes. Anything other than an
    /// approval becomes self-review feedback for the next cycle.
    async fn self_review(&self, history: &mut ChatHistory) -> Result<bool, AgentError> {
        history
            .append(ChatMessage::user(
                "Review the changes you just applied against the step definition. \
                 Reply APPROVED if they are complete and correct; otherwise \
                 describe what must change.",
            ))
            .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;

        let options = LoopOptions::new("self_review", 160_000).with_max_attempts(2);
        let verdict: String = self
            .deps
            .harness
            .run(history, options, |assistant, _responses, _state| {
                Some(assistant.content.as_text())
            })
            .await?;

        if verdict.trim().starts_with("APPROVED") {
            return Ok(true);
        }
        history
            .append(ChatMessage::user(verdict).with_tag(ContextTag::SelfReviewFeedback))
            .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;
        Ok(false)
    }

    /// Merge approval. Parameter-only updates (strategy, target branch)
    /// fold into the request while it waits; the target/base pair is kept
    /// consistent for everything downstream.
    async fn merge_approval(&self, requirements: &Requirements) -> Result<(), AgentError> {
        if !self.human_in_the_loop() {
            return Ok(());
        }
        let flow = self.flow();
        let target = flow
            .state
            .string_value("target_branch")
            .unwrap_or_else(|| "main".to_string());
        let params = HashMap::from([
            (PARAM_TARGET_BRANCH.to_string(), json!(target)),
            (PARAM_BASE_BRANCH.to_string(), json!(target)),
            (PARAM_MERGE_STRATEGY.to_string(), json!("merge")),
        ]);

        let outcome = flow
            .user
            .request(
                RequestForUser {
                    origin_flow_id: flow.flow_id.clone(),
                    flow_action_id: None,
                    content: format!(
                        "All steps are done. Approve the merge?\n\n{}",
                        requirements.render()
                    ),
                    subflow: "merge_approval".into(),
                    kind: RequestKind::MergeApproval,
                    params,
                },
                flow.cancel_token(),
            )
            .await
            .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;

        if !outcome.approved {
            return Err(AgentError::UserRejected {
                content: outcome.content,
            });
        }

        let mut params = outcome.params;
        let strategy = apply_merge_params(&mut params);
        if let Some(target) = params.get(PARAM_TARGET_BRANCH).and_then(|v| v.as_str()) {
            flow.state.set_string_value("target_branch", target);
            flow.state.set_string_value("base_branch", target);
        }
        if let Some(strategy) = strategy {
            flow.state.set_string_value("merge_strategy", strategy);
        }
        Ok(())
    }
}

/// Pump external signals into the flow: pause flips the flag and fires
/// the cancel queue; user actions either drive dev runs directly or queue
/// for the loops to consume.
pub fn spawn_signal_pump(
    flow: Arc<FlowContext>,
    supervisor: Arc<DevRunSupervisor>,
    config: RepoConfig,
    mut signals: mpsc::Receiver<FlowSignal>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            match signal {
                FlowSignal::Pause => {
                    log::info!("flow {}: pause requested", flow.flow_id);
                    flow.state.pause();
                    flow.state.cancel();
                }
                FlowSignal::UserAction(UserAction::DevRunStart { command_id }) => {
                    let Some(command) = config.dev_run.commands.get(&command_id).cloned() else {
                        log::warn!("dev_run_start for unknown command {command_id}");
                        continue;
                    };
                    let mut options = StartOptions::new(command_id.clone(), command);
                    options.env.flow_id = flow.flow_id.clone();
                    options.env.workspace_id = flow.workspace_id.clone();
                    if let Some(branch) = flow.state.string_value("source_branch") {
                        options.env.source_branch = branch;
                    }
                    if let Some(branch) = flow.state.string_value("target_branch") {
                        options.env.target_branch = branch.clone();
                        options.env.base_branch = branch;
                    }
                    if let Err(e) = supervisor.start(options).await {
                        log::warn!("dev_run_start {command_id} failed: {e}");
                    }
                }
                FlowSignal::UserAction(UserAction::DevRunStop { command_id }) => {
                    let timeout = config
                        .dev_run
                        .commands
                        .get(&command_id)
                        .map(|c| Duration::from_secs(c.stop_timeout_seconds));
                    if let Err(e) = supervisor.stop(&command_id, timeout).await {
                        log::warn!("dev_run_stop {command_id} failed: {e}");
                    }
                }
                FlowSignal::UserAction(action) => {
                    flow.state.set_user_action(action);
                }
            }
        }
    })
}

/// Wrap an activity so a failure becomes a "try again?" user request
/// instead of a subflow failure — only with a human in the loop and the
/// retry gate on.
pub async fn perform_with_user_retry<T, F, Fut>(
    flow: &FlowContext,
    human_in_the_loop: bool,
    subflow: &str,
    mut op: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AgentError>>,
{
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if human_in_the_loop && flow.gates.enabled(gates::USER_RETRY) => {
                log::warn!("{subflow}: activity failed, asking the user: {e}");
                let outcome = flow
                    .user
                    .request(
                        RequestForUser {
                            origin_flow_id: flow.flow_id.clone(),
                            flow_action_id: None,
                            content: format!("{subflow} failed: {e}. Try again?"),
                            subflow: subflow.to_string(),
                            kind: RequestKind::Continue,
                            params: HashMap::new(),
                        },
                        flow.cancel_token(),
                    )
                    .await
                    .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;
                if !outcome.approved {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_flow;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn user_retry_asks_and_retries_until_success() {
        let flow = test_flow("flow-retry");
        let ctx = flow.ctx.clone();
        let mut remote = flow.remote;

        let responder = tokio::spawn(async move {
            let request = remote.requests.recv().await.unwrap();
            assert_eq!(request.kind, RequestKind::Continue);
            assert!(request.content.contains("Try again?"));
            remote
                .responses
                .send(crate::interaction::UserResponse {
                    target_flow_id: request.origin_flow_id,
                    approved: Some(true),
                    ..Default::default()
                })
                .await
                .unwrap();
        });

        let calls = AtomicU32::new(0);
        let value = perform_with_user_retry(&ctx, true, "run_checks", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(AgentError::ToolExecFailure {
                    tool: "test".into(),
                    reason: "flaky".into(),
                })
            } else {
                Ok(41 + 1)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn user_retry_declined_propagates_the_failure() {
        let flow = test_flow("flow-retry");
        let ctx = flow.ctx.clone();
        let mut remote = flow.remote;

        tokio::spawn(async move {
            let request = remote.requests.recv().await.unwrap();
            remote
                .responses
                .send(crate::interaction::UserResponse {
                    target_flow_id: request.origin_flow_id,
                    approved: Some(false),
                    ..Default::default()
                })
                .await
                .unwrap();
        });

        let err = perform_with_user_retry(&ctx, true, "run_checks", || async {
            Err::<(), _>(AgentError::ToolExecFailure {
                tool: "test".into(),
                reason: "broken".into(),
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AgentError::ToolExecFailure { .. }));
    }

    #[tokio::test]
    async fn user_retry_without_a_human_fails_directly() {
        let flow = test_flow("flow-retry");
        let err = perform_with_user_retry(&flow.ctx, false, "run_checks", || async {
            Err::<(), _>(AgentError::ToolExecFailure {
                tool: "test".into(),
                reason: "broken".into(),
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AgentError::ToolExecFailure { .. }));
    }

    #[tokio::test]
    async fn signal_pump_pause_flips_flag_and_fires_cancel_queue() {
        let flow = test_flow("flow-pump");
        let ctx = flow.ctx.clone();
        let supervisor = Arc::new(crate::dev_run::DevRunSupervisor::new(
            "flow-pump",
            ctx.bus.clone(),
            ctx.state.clone(),
        ));
        let (tx, rx) = mpsc::channel(4);
        let pump = spawn_signal_pump(ctx.clone(), supervisor, RepoConfig::default(), rx);

        let scope = ctx.cancel_on_pause_scope();
        tx.send(FlowSignal::Pause).await.unwrap();
        tx.send(FlowSignal::UserAction(UserAction::GoNextStep))
            .await
            .unwrap();
        drop(tx);
        pump.await.unwrap();

        assert!(ctx.state.is_paused());
        assert!(scope.is_cancelled());
        assert_eq!(
            ctx.state.pending_user_action(),
            Some(UserAction::GoNextStep)
        );
    }

    #[tokio::test]
    async fn signal_pump_tolerates_unknown_dev_run_commands() {
        let flow = test_flow("flow-pump");
        let ctx = flow.ctx.clone();
        let supervisor = Arc::new(crate::dev_run::DevRunSupervisor::new(
            "flow-pump",
            ctx.bus.clone(),
            ctx.state.clone(),
        ));
        let (tx, rx) = mpsc::channel(4);
        let pump = spawn_signal_pump(ctx.clone(), supervisor, RepoConfig::default(), rx);

        tx.send(FlowSignal::UserAction(UserAction::DevRunStart {
            command_id: "ghost".into(),
        }))
        .await
        .unwrap();
        tx.send(FlowSignal::UserAction(UserAction::DevRunStop {
            command_id: "ghost".into(),
        }))
        .await
        .unwrap();
        drop(tx);
        pump.await.unwrap();
        assert!(ctx.state.dev_runs().is_empty());
    }
}
