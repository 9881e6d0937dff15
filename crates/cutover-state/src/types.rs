//! Persisted record types.
//!
//! These represent pipeline runs, archived deployments, and artifact
//! metadata. All types are serializable to/from JSON for storage in redb
//! tables. The phase and health enums also serve as the live vocabulary
//! of the rollout and health crates.

use serde::{Deserialize, Serialize};

use cutover_core::PayloadRef;

// ── Health ────────────────────────────────────────────────────────

/// Aggregated health of a target group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Every registered target passed its check.
    Healthy,
    /// Some, but not all, targets passed.
    Degraded,
    /// No target passed, or the check could not be evaluated.
    Unhealthy,
    /// Not checked yet.
    Unknown,
}

// ── Deployment ────────────────────────────────────────────────────

/// Phase of a deployment in the traffic shift state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    Initializing,
    Validating,
    Shifting,
    Finalizing,
    Completed,
    RollingBack,
    RolledBack,
    Failed,
}

impl DeploymentPhase {
    /// Terminal phases never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentPhase::Completed | DeploymentPhase::RolledBack | DeploymentPhase::Failed
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeploymentPhase::Initializing => "initializing",
            DeploymentPhase::Validating => "validating",
            DeploymentPhase::Shifting => "shifting",
            DeploymentPhase::Finalizing => "finalizing",
            DeploymentPhase::Completed => "completed",
            DeploymentPhase::RollingBack => "rolling_back",
            DeploymentPhase::RolledBack => "rolled_back",
            DeploymentPhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a deployment did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// Green never reached the healthy threshold in time.
    ValidationTimeout,
    /// Green health fell below the unhealthy threshold while shifting.
    HealthRegression,
    /// Too many consecutive shift ticks passed without an increment.
    ShiftStalled,
    /// An operator or the pipeline aborted the deployment.
    Aborted { reason: String },
    /// Blue could not be restored to full weight.
    RollbackIncomplete { detail: String },
    /// A target registry call failed.
    Infrastructure { detail: String },
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::ValidationTimeout => write!(f, "validation timeout"),
            FailureCause::HealthRegression => write!(f, "health regression"),
            FailureCause::ShiftStalled => write!(f, "shift stalled"),
            FailureCause::Aborted { reason } => write!(f, "aborted: {reason}"),
            FailureCause::RollbackIncomplete { detail } => {
                write!(f, "rollback incomplete: {detail}")
            }
            FailureCause::Infrastructure { detail } => write!(f, "infrastructure error: {detail}"),
        }
    }
}

/// Snapshot of one deployment attempt against a deployment group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub group: String,
    pub service: String,
    pub attempt: u64,
    /// Revision being rolled out (image digest or tag).
    pub revision: String,
    /// `simple` or `blue_green`.
    pub strategy: String,
    pub phase: DeploymentPhase,
    /// Production split at the time of the snapshot; the two always sum to 100.
    pub blue_weight: u8,
    pub green_weight: u8,
    /// Unix timestamp when the attempt started.
    pub started_at: u64,
    /// Unix timestamp of the latest phase change.
    pub last_transition_at: u64,
    pub failure: Option<FailureCause>,
}

impl DeploymentRecord {
    /// Build the composite key for the deployments table.
    pub fn table_key(&self) -> String {
        deployment_key(&self.group, self.attempt)
    }
}

pub(crate) fn deployment_key(group: &str, attempt: u64) -> String {
    format!("{group}:{attempt:010}")
}

// ── Pipeline runs ─────────────────────────────────────────────────

/// Overall status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Status of one stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
}

/// First failure of a run, surfaced verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunFailure {
    pub stage: String,
    pub action: String,
    pub cause: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineRunRecord {
    pub id: String,
    pub pipeline: String,
    pub branch: String,
    pub commit: String,
    pub status: RunStatus,
    pub stages: Vec<StageRecord>,
    pub failure: Option<RunFailure>,
    /// Unix timestamp when the run was triggered.
    pub started_at: u64,
    pub finished_at: Option<u64>,
}

impl PipelineRunRecord {
    pub fn stage_mut(&mut self, name: &str) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|s| s.name == name)
    }
}

// ── Artifacts ─────────────────────────────────────────────────────

/// Metadata of an artifact version produced during a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRecord {
    pub run_id: String,
    pub name: String,
    pub version: u32,
    pub producer_stage: String,
    pub payload: PayloadRef,
    /// Unix timestamp when the artifact was committed.
    pub created_at: u64,
}

impl ArtifactRecord {
    /// Build the composite key for the artifacts table.
    pub fn table_key(&self) -> String {
        format!("{}:{}:{:06}", self.run_id, self.name, self.version)
    }
}
