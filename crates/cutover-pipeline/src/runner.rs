//! Pipeline runner.
//!
//! Turns source triggers into runs. Each run gets a fresh id, a persisted
//! record that follows the sequencer's stage events, and a cancel switch.
//! Pushes to branches other than the configured one are ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use cutover_core::config::PipelineConfig;
use cutover_core::{RunId, epoch_secs};
use cutover_state::{
    PipelineRunRecord, RunFailure, RunStatus, StageRecord, StageStatus, StateStore,
};

use crate::action::Trigger;
use crate::error::{PipelineError, PipelineResult};
use crate::sequencer::{RunContext, RunResult, StageEvent, StageSequencer, StageSpec, stages_from_config};

/// A pipeline, ready to run.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub name: String,
    pub repository: String,
    pub branch: String,
    pub stages: Vec<StageSpec>,
}

impl PipelineDefinition {
    pub fn from_config(pipeline: &PipelineConfig) -> PipelineResult<Self> {
        Ok(Self {
            name: pipeline.name.clone(),
            repository: pipeline.source.repository.clone(),
            branch: pipeline.source.branch.clone(),
            stages: stages_from_config(pipeline)?,
        })
    }
}

/// Control handles of a run still in flight.
struct RunControl {
    cancel: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

struct RunnerInner {
    definition: PipelineDefinition,
    sequencer: StageSequencer,
    state: StateStore,
    active: Mutex<HashMap<RunId, RunControl>>,
}

#[derive(Clone)]
pub struct PipelineRunner {
    inner: Arc<RunnerInner>,
}

impl PipelineRunner {
    pub fn new(definition: PipelineDefinition, sequencer: StageSequencer, state: StateStore) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                definition,
                sequencer,
                state,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.inner.definition
    }

    /// Start a run for `trigger`. Returns `None` when the branch is not
    /// the pipeline's source branch.
    pub fn trigger(&self, trigger: Trigger) -> PipelineResult<Option<PipelineRunRecord>> {
        let definition = &self.inner.definition;
        if trigger.branch != definition.branch {
            info!(
                pipeline = %definition.name,
                branch = %trigger.branch,
                expected = %definition.branch,
                "ignoring push to untracked branch"
            );
            return Ok(None);
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let record = PipelineRunRecord {
            id: run_id.clone(),
            pipeline: definition.name.clone(),
            branch: trigger.branch.clone(),
            commit: trigger.commit.clone(),
            status: RunStatus::Running,
            stages: definition
                .stages
                .iter()
                .map(|s| StageRecord {
                    name: s.name.clone(),
                    status: StageStatus::Pending,
                })
                .collect(),
            failure: None,
            started_at: epoch_secs(),
            finished_at: None,
        };
        self.inner.state.put_run(&record)?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        self.lock_active()?.insert(
            run_id.clone(),
            RunControl {
                cancel: cancel_tx,
                done: done_rx,
            },
        );

        info!(
            run_id = %run_id,
            pipeline = %definition.name,
            branch = %trigger.branch,
            commit = %trigger.commit,
            "pipeline run triggered"
        );

        let inner = self.inner.clone();
        let ctx = RunContext {
            run_id,
            pipeline: definition.name.clone(),
            trigger,
        };
        let initial = record.clone();
        tokio::spawn(async move {
            inner.execute(ctx, initial, cancel_rx).await;
            // Receivers may all be gone; nothing to tell then.
            let _ = done_tx.send(true);
        });

        Ok(Some(record))
    }

    pub fn get(&self, run_id: &str) -> PipelineResult<PipelineRunRecord> {
        self.inner
            .state
            .get_run(run_id)?
            .ok_or_else(|| PipelineError::RunNotFound(run_id.to_string()))
    }

    /// All runs, newest first.
    pub fn list(&self) -> PipelineResult<Vec<PipelineRunRecord>> {
        Ok(self.inner.state.list_runs()?)
    }

    /// Request cancellation. A finished run is returned unchanged.
    pub fn cancel(&self, run_id: &str) -> PipelineResult<PipelineRunRecord> {
        if let Some(control) = self.lock_active()?.get(run_id) {
            info!(run_id, "cancelling pipeline run");
            control.cancel.send_replace(true);
        }
        self.get(run_id)
    }

    /// Wait for a run to finish and return its final record.
    pub async fn wait(&self, run_id: &str) -> PipelineResult<PipelineRunRecord> {
        let done = self.lock_active()?.get(run_id).map(|c| c.done.clone());
        if let Some(mut done) = done {
            // A dropped sender means the run task is gone; the store has
            // whatever it last wrote.
            let _ = done.wait_for(|d| *d).await;
        }
        self.get(run_id)
    }

    fn lock_active(&self) -> PipelineResult<std::sync::MutexGuard<'_, HashMap<RunId, RunControl>>> {
        self.inner
            .active
            .lock()
            .map_err(|_| PipelineError::ActionFailed("run table lock poisoned".to_string()))
    }
}

impl RunnerInner {
    async fn execute(&self, ctx: RunContext, record: PipelineRunRecord, cancel: watch::Receiver<bool>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<StageEvent>();

        let follow = async {
            let mut record = record;
            while let Some(event) = rx.recv().await {
                if let Some(stage) = record.stage_mut(&event.stage) {
                    stage.status = event.status;
                }
                self.persist(&record);
            }
            record
        };
        let (result, mut record) = tokio::join!(
            self.sequencer.run(&ctx, &self.definition.stages, cancel, tx),
            follow
        );

        match result {
            RunResult::Succeeded => record.status = RunStatus::Succeeded,
            RunResult::Cancelled => record.status = RunStatus::Cancelled,
            RunResult::Failed {
                stage,
                action,
                cause,
            } => {
                record.status = RunStatus::Failed;
                record.failure = Some(RunFailure {
                    stage,
                    action,
                    cause,
                });
            }
        }
        record.finished_at = Some(epoch_secs());
        self.persist(&record);

        if let Err(e) = self.sequencer.artifacts().release_run(&ctx.run_id).await {
            warn!(run_id = %ctx.run_id, error = %e, "failed to release run artifacts");
        }

        if let Ok(mut active) = self.active.lock() {
            active.remove(&ctx.run_id);
        }
        info!(run_id = %ctx.run_id, status = ?record.status, "pipeline run finished");
    }

    fn persist(&self, record: &PipelineRunRecord) {
        if let Err(e) = self.state.put_run(record) {
            warn!(run_id = %record.id, error = %e, "failed to persist run record");
        }
    }
}
