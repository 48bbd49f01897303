//! End-to-end pipeline tests over scripted collaborators: requirements →
//! plan → step execution → merge, with approvals, a rejection round, and
//! the human-free path.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use side::{ChatMessage, MockProvider, ToolCall};
use side_agent::collab::LocalWorkspaceFiles;
use side_agent::dev_run::DevRunSupervisor;
use side_agent::events::CloseReason;
use side_agent::flow::ActionStatus;
use side_agent::flows::{FlowDeps, PlanAndExecute};
use side_agent::interaction::{RequestKind, UserAction, UserResponse};
use side_agent::loops::LoopHarness;
use side_agent::test_support::{StubCheckRunner, StubSearcher, StubSymbolRetriever, test_flow};
use side_agent::tools::{
    BulkReadFileTool, BulkSearchRepositoryTool, GetHelpOrInputTool, GetSymbolDefinitionsTool,
    ReadImageTool, RecordDevPlanTool, RecordDevRequirementsTool, ToolOverrides, ToolRegistry,
    UpdateDevPlanTool, UpdateDevRequirementsTool,
};
use tempfile::TempDir;

fn full_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .add(Arc::new(GetSymbolDefinitionsTool))
        .add(Arc::new(BulkSearchRepositoryTool::default()))
        .add(Arc::new(BulkReadFileTool))
        .add(Arc::new(ReadImageTool))
        .add(Arc::new(GetHelpOrInputTool::new("execute_step")))
        .add(Arc::new(RecordDevRequirementsTool))
        .add(Arc::new(UpdateDevRequirementsTool))
        .add(Arc::new(RecordDevPlanTool))
        .add(Arc::new(UpdateDevPlanTool));
    registry
}

fn record_requirements_call(id: &str) -> ToolCall {
    ToolCall::new(
        id,
        "record_dev_requirements",
        json!({
            "overview": "Make greet friendlier",
            "acceptanceCriteria": ["greet prints a message"],
            "finalized": true
        })
        .to_string(),
    )
}

fn record_plan_call(id: &str) -> ToolCall {
    ToolCall::new(
        id,
        "record_dev_plan",
        json!({
            "steps": [{"title": "update greet", "definition": "make greet print"}],
            "finalized": true
        })
        .to_string(),
    )
}

fn edit_block_message() -> ChatMessage {
    ChatMessage::assistant(
        "Applying the change:\n\
         ```edit_block:1 update src/lib.rs\n\
         oldLines:\n\
         fn greet() {}\n\
         newLines:\n\
         fn greet() { println!(\"hi\"); }\n\
         ```",
    )
}

struct Pipeline {
    flow: side_agent::test_support::TestFlow,
    deps: FlowDeps,
    workspace: TempDir,
}

fn pipeline(provider: MockProvider, config: side_agent::config::RepoConfig) -> Pipeline {
    let _ = env_logger::builder().is_test(true).try_init();
    let workspace = TempDir::new().unwrap();
    std::fs::create_dir_all(workspace.path().join("src")).unwrap();
    std::fs::write(workspace.path().join("src/lib.rs"), "fn greet() {}\n").unwrap();

    let flow = test_flow("flow-e2e");
    let harness = LoopHarness {
        flow: flow.ctx.clone(),
        provider: Arc::new(provider),
        registry: full_registry(),
        overrides: ToolOverrides::new(),
        files: Arc::new(LocalWorkspaceFiles::new(workspace.path())),
        symbols: Arc::new(StubSymbolRetriever::default()),
        search: Arc::new(StubSearcher::default()),
    };
    let supervisor = Arc::new(DevRunSupervisor::new(
        "flow-e2e",
        flow.ctx.bus.clone(),
        flow.ctx.state.clone(),
    ));
    let deps = FlowDeps {
        harness,
        config,
        checks: Arc::new(StubCheckRunner::default()),
        supervisor,
    };
    Pipeline {
        flow,
        deps,
        workspace,
    }
}

fn config_with_tests() -> side_agent::config::RepoConfig {
    side_agent::config::RepoConfig {
        mission: Some("Keep the greeting service healthy.".into()),
        test_commands: Some(vec!["cargo test".into()]),
        ..Default::default()
    }
}

#[tokio::test]
async fn full_pipeline_with_a_rejection_round_completes() {
    let provider = MockProvider::new();
    // Code context: the model declines to gather anything.
    provider.push_message(ChatMessage::assistant("no context needed"));
    // Requirements, rejected once then re-finalized.
    provider.push_message(
        ChatMessage::assistant("").with_tool_calls(vec![record_requirements_call("c1")]),
    );
    provider.push_message(
        ChatMessage::assistant("").with_tool_calls(vec![record_requirements_call("c2")]),
    );
    // Plan.
    provider.push_message(ChatMessage::assistant("").with_tool_calls(vec![record_plan_call("c3")]));
    // Step: edit blocks, then the self-review verdict.
    provider.push_message(edit_block_message());
    provider.push_message(ChatMessage::assistant("APPROVED"));

    let Pipeline {
        flow,
        deps,
        workspace,
    } = pipeline(provider, config_with_tests());
    let mut remote = flow.remote;
    let mut closed_rx = flow.closed_rx;
    let persistence = flow.persistence;
    let state = flow.ctx.state.clone();

    // Answer the approval requests: reject requirements once, approve the
    // retry, approve the plan, approve the merge with a squash strategy.
    let responder = tokio::spawn(async move {
        let mut approvals = Vec::new();
        let mut rejected_requirements = false;
        while let Some(request) = remote.requests.recv().await {
            approvals.push((request.subflow.clone(), request.kind));
            let response = match request.kind {
                RequestKind::Approval if request.subflow == "build_requirements" => {
                    if rejected_requirements {
                        UserResponse {
                            target_flow_id: request.origin_flow_id.clone(),
                            approved: Some(true),
                            ..Default::default()
                        }
                    } else {
                        rejected_requirements = true;
                        UserResponse {
                            target_flow_id: request.origin_flow_id.clone(),
                            approved: Some(false),
                            content: "also cover the empty-name case".into(),
                            ..Default::default()
                        }
                    }
                }
                RequestKind::MergeApproval => UserResponse {
                    target_flow_id: request.origin_flow_id.clone(),
                    approved: Some(true),
                    params: HashMap::from([("mergeStrategy".to_string(), json!("squash"))]),
                    ..Default::default()
                },
                _ => UserResponse {
                    target_flow_id: request.origin_flow_id.clone(),
                    approved: Some(true),
                    ..Default::default()
                },
            };
            if remote.responses.send(response).await.is_err() {
                break;
            }
        }
        approvals
    });

    let orchestrator = PlanAndExecute::new(deps);
    // Both queries answer before anything runs.
    assert!(orchestrator.dev_run_config().commands.is_empty());
    assert!(orchestrator.dev_run_state().is_empty());

    let reason = orchestrator.run("make greet print a message").await;
    assert_eq!(reason, CloseReason::Completed);

    // Closure signal reached the parent.
    let closed = closed_rx.recv().await.unwrap();
    assert_eq!(closed.reason, CloseReason::Completed);

    // The edit actually landed.
    let edited = std::fs::read_to_string(workspace.path().join("src/lib.rs")).unwrap();
    assert!(edited.contains("println!(\"hi\")"));

    // Merge parameters were recorded consistently.
    assert_eq!(state.string_value("merge_strategy").as_deref(), Some("squash"));
    assert_eq!(state.string_value("target_branch").as_deref(), Some("main"));
    assert_eq!(state.string_value("base_branch").as_deref(), Some("main"));

    // A work branch was derived from the task.
    let branch = state.string_value("source_branch").unwrap();
    assert!(side_agent::branch::is_valid_branch_name(&branch), "{branch}");

    // Tracked actions ran to completion.
    let actions = persistence.actions();
    for action_type in [
        "prepare_code_context",
        "build_requirements",
        "build_plan",
        "execute_step",
    ] {
        assert!(
            actions
                .iter()
                .any(|a| a.action_type == action_type
                    && a.action_status == ActionStatus::Completed),
            "missing completed action {action_type}"
        );
    }

    // Release both flow-context handles so the request channel closes and
    // the responder drains out.
    drop(orchestrator);
    drop(flow.ctx);
    let approvals = responder.await.unwrap();
    let requirement_approvals = approvals
        .iter()
        .filter(|(s, _)| s == "build_requirements")
        .count();
    assert_eq!(requirement_approvals, 2, "rejected once, approved once");
    assert!(
        approvals
            .iter()
            .any(|(_, k)| *k == RequestKind::MergeApproval)
    );
}

#[tokio::test]
async fn human_free_run_asks_nothing_and_honors_skip_action() {
    let provider = MockProvider::new();
    provider.push_message(ChatMessage::assistant("no context needed"));
    provider.push_message(
        ChatMessage::assistant("").with_tool_calls(vec![record_requirements_call("c1")]),
    );
    provider.push_message(ChatMessage::assistant("").with_tool_calls(vec![record_plan_call("c2")]));
    // No step or review messages: the queued user action skips the step.

    let config = side_agent::config::RepoConfig {
        disable_human_in_the_loop: true,
        ..config_with_tests()
    };
    let Pipeline {
        flow,
        deps,
        workspace,
    } = pipeline(provider, config);
    let mut remote = flow.remote;
    flow.ctx.state.set_user_action(UserAction::GoNextStep);

    let orchestrator = PlanAndExecute::new(deps);
    let reason = orchestrator.run("make greet print a message").await;
    assert_eq!(reason, CloseReason::Completed);

    // No user requests were ever opened.
    assert!(remote.requests.try_recv().is_err());
    // The step was skipped, so the file is untouched.
    let contents = std::fs::read_to_string(workspace.path().join("src/lib.rs")).unwrap();
    assert_eq!(contents, "fn greet() {}\n");
}
