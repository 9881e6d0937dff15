//! Approval gate.
//!
//! An approval action registers a pending request keyed by run and stage
//! and then sleeps on a oneshot channel until a decision is delivered.
//! There is no polling; `decide` wakes the waiting action directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{info, warn};

use cutover_core::{RunId, epoch_secs};

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

/// A decision as delivered on the approval channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub run_id: RunId,
    pub stage: String,
    pub decision: Decision,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Who is being asked, about what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub run_id: RunId,
    pub stage: String,
    pub action: String,
    /// Free-form approver hint from the action config (team, channel).
    pub notify: Option<String>,
    pub requested_at: u64,
}

type Key = (RunId, String);

struct Pending {
    request: ApprovalRequest,
    tx: oneshot::Sender<ApprovalDecision>,
}

#[derive(Clone, Default)]
pub struct ApprovalGate {
    pending: Arc<Mutex<HashMap<Key, Pending>>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending approval. Only one may be pending per run and stage.
    pub fn request(&self, request: ApprovalRequest) -> PipelineResult<ApprovalTicket> {
        let key = (request.run_id.clone(), request.stage.clone());
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock()?;
        if pending.contains_key(&key) {
            return Err(PipelineError::Configuration(format!(
                "stage {} of run {} already has a pending approval",
                request.stage, request.run_id
            )));
        }
        info!(
            run_id = %request.run_id,
            stage = %request.stage,
            action = %request.action,
            notify = request.notify.as_deref().unwrap_or("-"),
            "approval requested"
        );
        pending.insert(key.clone(), Pending { request, tx });
        Ok(ApprovalTicket {
            key,
            rx,
            gate: self.clone(),
        })
    }

    /// Deliver a decision to the waiting action.
    pub fn decide(&self, decision: ApprovalDecision) -> PipelineResult<()> {
        let key = (decision.run_id.clone(), decision.stage.clone());
        let entry = self.lock()?.remove(&key);
        let Some(entry) = entry else {
            return Err(PipelineError::ApprovalNotFound {
                run_id: decision.run_id,
                stage: decision.stage,
            });
        };
        info!(
            run_id = %decision.run_id,
            stage = %decision.stage,
            decision = ?decision.decision,
            comment = decision.comment.as_deref().unwrap_or(""),
            "approval decided"
        );
        entry
            .tx
            .send(decision)
            .map_err(|d| PipelineError::ApprovalNotFound {
                run_id: d.run_id,
                stage: d.stage,
            })
    }

    /// Requests still waiting for a decision.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        match self.lock() {
            Ok(pending) => pending.values().map(|p| p.request.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn lock(&self) -> PipelineResult<std::sync::MutexGuard<'_, HashMap<Key, Pending>>> {
        self.pending
            .lock()
            .map_err(|_| PipelineError::ActionFailed("approval gate lock poisoned".to_string()))
    }

    fn withdraw(&self, key: &Key) {
        if let Ok(mut pending) = self.pending.lock() {
            if pending.remove(key).is_some() {
                warn!(run_id = %key.0, stage = %key.1, "approval withdrawn");
            }
        }
    }
}

/// Held by the waiting action. Dropping it withdraws the request.
pub struct ApprovalTicket {
    key: Key,
    rx: oneshot::Receiver<ApprovalDecision>,
    gate: ApprovalGate,
}

impl ApprovalTicket {
    /// Wait for a decision. `Reject` and an expired timeout are errors.
    pub async fn wait(mut self, timeout: Option<Duration>) -> PipelineResult<ApprovalDecision> {
        let received = match timeout {
            None => (&mut self.rx).await,
            Some(limit) => match tokio::time::timeout(limit, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => return Err(PipelineError::ApprovalTimedOut(limit.as_secs())),
            },
        };
        let decision = received.map_err(|_| PipelineError::ApprovalNotFound {
            run_id: self.key.0.clone(),
            stage: self.key.1.clone(),
        })?;
        match decision.decision {
            Decision::Approve => Ok(decision),
            Decision::Reject => Err(PipelineError::ApprovalRejected {
                comment: decision.comment,
            }),
        }
    }
}

impl Drop for ApprovalTicket {
    fn drop(&mut self) {
        self.gate.withdraw(&self.key);
    }
}

impl ApprovalRequest {
    pub fn new(run_id: &str, stage: &str, action: &str, notify: Option<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage: stage.to_string(),
            action: action.to_string(),
            notify,
            requested_at: epoch_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(decision: Decision, comment: Option<&str>) -> ApprovalDecision {
        ApprovalDecision {
            run_id: "run-1".to_string(),
            stage: "DeployProd".to_string(),
            decision,
            comment: comment.map(str::to_string),
        }
    }

    fn request() -> ApprovalRequest {
        ApprovalRequest::new("run-1", "DeployProd", "ManualApproval", Some("release".to_string()))
    }

    #[tokio::test]
    async fn approve_wakes_waiter() {
        let gate = ApprovalGate::new();
        let ticket = gate.request(request()).unwrap();
        assert_eq!(gate.pending().len(), 1);

        let waiter = tokio::spawn(ticket.wait(None));
        gate.decide(decision(Decision::Approve, Some("ship it"))).unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.comment.as_deref(), Some("ship it"));
        assert!(gate.pending().is_empty());
    }

    #[tokio::test]
    async fn reject_is_an_error_with_comment() {
        let gate = ApprovalGate::new();
        let ticket = gate.request(request()).unwrap();
        gate.decide(decision(Decision::Reject, Some("not today"))).unwrap();

        let err = ticket.wait(None).await.unwrap_err();
        assert!(matches!(err, PipelineError::ApprovalRejected { .. }));
        assert_eq!(err.to_string(), "rejected: not today");
    }

    #[tokio::test]
    async fn deciding_unknown_request_fails() {
        let gate = ApprovalGate::new();
        let err = gate.decide(decision(Decision::Approve, None)).unwrap_err();
        assert!(matches!(err, PipelineError::ApprovalNotFound { .. }));
    }

    #[tokio::test]
    async fn duplicate_request_rejected() {
        let gate = ApprovalGate::new();
        let _ticket = gate.request(request()).unwrap();
        assert!(gate.request(request()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_expires_and_withdraws() {
        let gate = ApprovalGate::new();
        let ticket = gate.request(request()).unwrap();

        let err = ticket
            .wait(Some(Duration::from_secs(3600)))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ApprovalTimedOut(3600)));
        assert!(gate.pending().is_empty());
    }

    #[tokio::test]
    async fn dropped_ticket_withdraws_request() {
        let gate = ApprovalGate::new();
        drop(gate.request(request()).unwrap());
        assert!(gate.pending().is_empty());
        assert!(gate.decide(decision(Decision::Approve, None)).is_err());
    }
}
