//! Shared collaborator doubles for unit and integration tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::collab::{
    CheckKind, CheckOutcome, CollabError, FlowPersistence, RepoSearcher, SearchRequest,
    SearchResults, SymbolRequest, SymbolRetrieval, SymbolRetriever,
};
use crate::event_bus::EventBus;
use crate::flow::{ActionStatus, FlowAction, FlowClosed, FlowContext, Gates, GlobalState};
use crate::interaction::{UserLinkRemote, user_link};

/// Persistence double that records every action transition in order.
#[derive(Default)]
pub struct RecordingPersistence {
    records: Mutex<Vec<FlowAction>>,
}

impl RecordingPersistence {
    pub fn statuses(&self) -> Vec<ActionStatus> {
        self.records.lock().iter().map(|a| a.action_status).collect()
    }

    pub fn actions(&self) -> Vec<FlowAction> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl FlowPersistence for RecordingPersistence {
    async fn create_flow_action(&self, action: &FlowAction) -> Result<(), CollabError> {
        self.records.lock().push(action.clone());
        Ok(())
    }

    async fn update_flow_action(&self, action: &FlowAction) -> Result<(), CollabError> {
        self.records.lock().push(action.clone());
        Ok(())
    }
}

/// Symbol retriever double: every requested symbol resolves to a stub
/// definition of configurable size.
pub struct StubSymbolRetriever {
    pub definition_size: usize,
    pub fail_paths: Vec<String>,
}

impl Default for StubSymbolRetriever {
    fn default() -> Self {
        Self {
            definition_size: 64,
            fail_paths: Vec::new(),
        }
    }
}

#[async_trait]
impl SymbolRetriever for StubSymbolRetriever {
    async fn retrieve(
        &self,
        requests: &[SymbolRequest],
    ) -> Result<Vec<SymbolRetrieval>, CollabError> {
        Ok(requests
            .iter()
            .map(|req| {
                if self.fail_paths.contains(&req.file_path) {
                    SymbolRetrieval {
                        file_path: req.file_path.clone(),
                        definitions: String::new(),
                        failure: Some(format!("no symbols found in {}", req.file_path)),
                    }
                } else {
                    let names = if req.symbol_names.is_empty() {
                        vec!["<file>".to_string()]
                    } else {
                        req.symbol_names.clone()
                    };
                    let body: String = names
                        .iter()
                        .map(|n| {
                            format!("// {}:{}\n{}\n", req.file_path, n, "x".repeat(self.definition_size))
                        })
                        .collect();
                    SymbolRetrieval {
                        file_path: req.file_path.clone(),
                        definitions: body,
                        failure: None,
                    }
                }
            })
            .collect())
    }
}

/// Searcher double returning a fixed rendering plus file list.
#[derive(Default)]
pub struct StubSearcher {
    pub rendered: String,
    pub files: Vec<String>,
}

#[async_trait]
impl RepoSearcher for StubSearcher {
    async fn bulk_search(&self, _searches: &[SearchRequest]) -> Result<SearchResults, CollabError> {
        Ok(SearchResults {
            rendered: self.rendered.clone(),
            files: self.files.clone(),
        })
    }
}

/// Check runner double with scripted pass/fail per kind.
#[derive(Default)]
pub struct StubCheckRunner {
    outcomes: Mutex<Vec<(CheckKind, CheckOutcome)>>,
}

impl StubCheckRunner {
    pub fn push(&self, kind: CheckKind, success: bool, output: &str) {
        self.outcomes.lock().push((
            kind,
            CheckOutcome {
                success,
                output: output.to_string(),
            },
        ));
    }
}

#[async_trait]
impl crate::collab::CheckRunner for StubCheckRunner {
    async fn run(&self, kind: CheckKind, _command: &str) -> Result<CheckOutcome, CollabError> {
        let mut outcomes = self.outcomes.lock();
        if let Some(pos) = outcomes.iter().position(|(k, _)| *k == kind) {
            let (_, outcome) = outcomes.remove(pos);
            Ok(outcome)
        } else {
            Ok(CheckOutcome {
                success: true,
                output: String::new(),
            })
        }
    }
}

/// A fully wired flow context backed by recording doubles.
pub struct TestFlow {
    pub ctx: Arc<FlowContext>,
    pub persistence: Arc<RecordingPersistence>,
    pub remote: UserLinkRemote,
    pub closed_rx: tokio::sync::mpsc::Receiver<FlowClosed>,
}

pub fn test_flow(flow_id: &str) -> TestFlow {
    let (user, remote) = user_link(16);
    let (closed_tx, closed_rx) = tokio::sync::mpsc::channel(1);
    let persistence = Arc::new(RecordingPersistence::default());
    let ctx = Arc::new(FlowContext::new(
        flow_id,
        "ws-test",
        Arc::new(GlobalState::new()),
        Arc::new(EventBus::new()),
        Arc::new(user),
        Gates::latest(),
        persistence.clone(),
        closed_tx,
    ));
    TestFlow {
        ctx,
        persistence,
        remote,
        closed_rx,
    }
}
