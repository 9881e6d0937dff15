//! cutover pipelines — artifact handoff, stage sequencing, approval gates.
//!
//! A pipeline is an ordered list of stages. Each stage runs its actions in
//! `run_order` groups, hands named artifacts to later stages, and the
//! deploy actions hand off to a `cutover-rollout` deployment group.
//!
//! # Components
//!
//! - **`artifact`** — Versioned, content-addressed artifacts per run
//! - **`action`** — Action specs, execution context, executor registry
//! - **`executors`** — Source, shell build, approval and deploy executors
//! - **`approval`** — Pending approvals woken by a delivered decision
//! - **`sequencer`** — Stage ordering, run-order groups, fail-fast
//! - **`runner`** — Triggers, persisted run records, cancellation

pub mod action;
pub mod approval;
pub mod artifact;
pub mod error;
pub mod executors;
pub mod runner;
pub mod sequencer;

pub use action::{ActionContext, ActionExecutor, ActionOutput, ActionSettings, ActionSpec, Executors, Trigger};
pub use approval::{ApprovalDecision, ApprovalGate, ApprovalRequest, ApprovalTicket, Decision};
pub use artifact::{ArtifactBlobStore, ArtifactHandle, ArtifactStore, FsBlobStore, InMemoryBlobStore};
pub use error::{PipelineError, PipelineResult};
pub use executors::{
    ApprovalExecutor, DeployExecutor, DeployTarget, ShellExecutor, SourceExecutor, standard_executors,
};
pub use runner::{PipelineDefinition, PipelineRunner};
pub use sequencer::{RunContext, RunResult, StageEvent, StageSequencer, StageSpec};
