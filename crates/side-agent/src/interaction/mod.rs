//! User interaction: requests for guidance, approvals, and user actions.
//!
//! A flow never talks to a UI. It publishes a [`RequestForUser`] to its
//! parent over the user link and waits for a [`UserResponse`]. Responses
//! that carry only parameter updates adjust the outstanding request in
//! place and keep the wait alive, so a user can e.g. flip the target
//! branch or merge strategy without being re-prompted.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// External user actions delivered over the `user_action` signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UserAction {
    GoNextStep,
    DevRunStart { command_id: String },
    DevRunStop { command_id: String },
}

/// What kind of answer a request expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    FreeForm,
    Approval,
    MergeApproval,
    Continue,
}

/// A request published to the parent workflow. At most one may be
/// outstanding per subflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestForUser {
    pub origin_flow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_action_id: Option<String>,
    pub content: String,
    pub subflow: String,
    pub kind: RequestKind,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

/// A response delivered over the `user_response` signal. Either `approved`
/// is set (terminating an approval) or the response is a params-only
/// update and the request keeps waiting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserResponse {
    pub target_flow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

/// Final outcome of an approval wait.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    pub approved: bool,
    pub content: String,
    /// Request params as of the terminating response, including any
    /// updates applied along the way.
    pub params: HashMap<String, Value>,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InteractionError {
    #[error("a user request is already outstanding for subflow {subflow}")]
    AlreadyOutstanding { subflow: String },

    #[error("user link closed")]
    LinkClosed,

    #[error("wait cancelled")]
    Cancelled,
}

/// The flow side of the user channel pair: requests go out, responses come
/// back in receipt order.
pub struct UserLink {
    outbound: mpsc::Sender<RequestForUser>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<UserResponse>>,
    outstanding: Mutex<HashSet<String>>,
}

/// The external side: feed responses, observe requests.
pub struct UserLinkRemote {
    pub requests: mpsc::Receiver<RequestForUser>,
    pub responses: mpsc::Sender<UserResponse>,
}

/// Build a connected link pair: `(flow side, external side)`.
pub fn user_link(buffer: usize) -> (UserLink, UserLinkRemote) {
    let (req_tx, req_rx) = mpsc::channel(buffer);
    let (resp_tx, resp_rx) = mpsc::channel(buffer);
    (
        UserLink {
            outbound: req_tx,
            inbound: tokio::sync::Mutex::new(resp_rx),
            outstanding: Mutex::new(HashSet::new()),
        },
        UserLinkRemote {
            requests: req_rx,
            responses: resp_tx,
        },
    )
}

impl UserLink {
    /// Publish a request and wait for the response that terminates it.
    ///
    /// For `FreeForm`/`Continue` requests any response terminates. For
    /// approvals, only a response with `approved` set terminates; params-only
    /// responses are merged into the request and the wait continues.
    pub async fn request(
        &self,
        mut request: RequestForUser,
        cancel: &CancellationToken,
    ) -> Result<ApprovalOutcome, InteractionError> {
        {
            let mut outstanding = self.outstanding.lock();
            if !outstanding.insert(request.subflow.clone()) {
                return Err(InteractionError::AlreadyOutstanding {
                    subflow: request.subflow.clone(),
                });
            }
        }
        let result = self.request_inner(&mut request, cancel).await;
        self.outstanding.lock().remove(&request.subflow);
        result
    }

    async fn request_inner(
        &self,
        request: &mut RequestForUser,
        cancel: &CancellationToken,
    ) -> Result<ApprovalOutcome, InteractionError> {
        self.outbound
            .send(request.clone())
            .await
            .map_err(|_| InteractionError::LinkClosed)?;

        let mut inbound = self.inbound.lock().await;
        loop {
            let response = tokio::select! {
                r = inbound.recv() => r.ok_or(InteractionError::LinkClosed)?,
                _ = cancel.cancelled() => return Err(InteractionError::Cancelled),
            };

            // Params-only update: fold into the outstanding request and
            // keep waiting for the real answer.
            let terminates = match request.kind {
                RequestKind::Approval | RequestKind::MergeApproval => response.approved.is_some(),
                RequestKind::FreeForm | RequestKind::Continue => true,
            };

            for (k, v) in &response.params {
                request.params.insert(k.clone(), v.clone());
            }

            if terminates {
                return Ok(ApprovalOutcome {
                    approved: response.approved.unwrap_or(true),
                    content: response.content,
                    params: request.params.clone(),
                });
            }
        }
    }
}

/// Merge-approval parameter keys with cross-field consistency.
pub const PARAM_MERGE_STRATEGY: &str = "mergeStrategy";
pub const PARAM_TARGET_BRANCH: &str = "targetBranch";
pub const PARAM_BASE_BRANCH: &str = "baseBranch";

/// Apply merge-approval semantics to a params update: whenever the target
/// branch changes, the base branch follows it so downstream scripts see a
/// consistent pair. Returns the validated merge strategy, if present.
pub fn apply_merge_params(params: &mut HashMap<String, Value>) -> Option<String> {
    if let Some(target) = params.get(PARAM_TARGET_BRANCH).cloned() {
        params.insert(PARAM_BASE_BRANCH.to_string(), target);
    }
    params
        .get(PARAM_MERGE_STRATEGY)
        .and_then(Value::as_str)
        .filter(|s| *s == "squash" || *s == "merge")
        .map(|s| s.to_string())
}
