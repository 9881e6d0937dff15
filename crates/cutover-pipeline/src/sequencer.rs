//! Stage sequencer.
//!
//! Runs stages strictly in order. Inside a stage, actions are grouped by
//! `run_order`: a group starts all its actions at once and must finish
//! entirely before the next group starts. The first failing action aborts
//! its siblings and ends the run; no later stage starts.
//!
//! ```text
//! Stage "DeployProd"
//!   run_order 1: [ManualApproval]            ── JoinSet
//!   run_order 2: [BlueGreen]                 ── JoinSet
//!   commit outputs → ArtifactStore
//! ```
//!
//! Outputs are committed only when the whole stage succeeded, so a later
//! stage never reads an artifact of a stage that failed halfway.

use std::collections::{BTreeMap, HashMap};
use std::future::pending;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};

use cutover_core::config::PipelineConfig;
use cutover_state::StageStatus;

use crate::action::{ActionContext, ActionOutput, ActionSpec, Executors, Trigger};
use crate::artifact::{ArtifactHandle, ArtifactStore};
use crate::error::{PipelineError, PipelineResult};

/// One stage, ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub name: String,
    pub actions: Vec<ActionSpec>,
}

impl StageSpec {
    /// Actions grouped by `run_order`, ascending.
    pub fn groups(&self) -> BTreeMap<u32, Vec<&ActionSpec>> {
        let mut groups: BTreeMap<u32, Vec<&ActionSpec>> = BTreeMap::new();
        for action in &self.actions {
            groups.entry(action.run_order).or_default().push(action);
        }
        groups
    }
}

/// Build stage specs from a validated pipeline config.
pub fn stages_from_config(pipeline: &PipelineConfig) -> PipelineResult<Vec<StageSpec>> {
    pipeline
        .stages
        .iter()
        .map(|stage| -> PipelineResult<StageSpec> {
            Ok(StageSpec {
                name: stage.name.clone(),
                actions: stage
                    .actions
                    .iter()
                    .map(|a| ActionSpec::from_config(a, &pipeline.source))
                    .collect::<PipelineResult<_>>()?,
            })
        })
        .collect()
}

/// Outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunResult {
    Succeeded,
    Failed {
        stage: String,
        action: String,
        cause: String,
    },
    Cancelled,
}

/// Stage status change, emitted as the run progresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEvent {
    pub stage: String,
    pub status: StageStatus,
}

/// Identity of the run being sequenced.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub pipeline: String,
    pub trigger: Trigger,
}

/// How one stage ended.
enum StageOutcome {
    Succeeded,
    Failed { action: String, cause: String },
    Cancelled,
}

pub struct StageSequencer {
    executors: Executors,
    artifacts: ArtifactStore,
}

impl StageSequencer {
    pub fn new(executors: Executors, artifacts: ArtifactStore) -> Self {
        Self {
            executors,
            artifacts,
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Run `stages` in order until one fails or `cancel` turns true.
    pub async fn run(
        &self,
        run: &RunContext,
        stages: &[StageSpec],
        mut cancel: watch::Receiver<bool>,
        events: mpsc::UnboundedSender<StageEvent>,
    ) -> RunResult {
        info!(run_id = %run.run_id, pipeline = %run.pipeline, stages = stages.len(), "run started");
        let emit = |stage: &str, status: StageStatus| {
            // The receiver going away only means nobody is watching.
            let _ = events.send(StageEvent {
                stage: stage.to_string(),
                status,
            });
        };

        for (idx, stage) in stages.iter().enumerate() {
            if *cancel.borrow() {
                for rest in &stages[idx..] {
                    emit(&rest.name, StageStatus::Cancelled);
                }
                info!(run_id = %run.run_id, "run cancelled before stage {}", stage.name);
                return RunResult::Cancelled;
            }

            emit(&stage.name, StageStatus::Running);
            match self.run_stage(run, stage, &mut cancel).await {
                StageOutcome::Succeeded => emit(&stage.name, StageStatus::Succeeded),
                StageOutcome::Failed { action, cause } => {
                    emit(&stage.name, StageStatus::Failed);
                    error!(
                        run_id = %run.run_id,
                        stage = %stage.name,
                        action = %action,
                        %cause,
                        "run failed"
                    );
                    return RunResult::Failed {
                        stage: stage.name.clone(),
                        action,
                        cause,
                    };
                }
                StageOutcome::Cancelled => {
                    emit(&stage.name, StageStatus::Cancelled);
                    for rest in &stages[idx + 1..] {
                        emit(&rest.name, StageStatus::Cancelled);
                    }
                    info!(run_id = %run.run_id, stage = %stage.name, "run cancelled");
                    return RunResult::Cancelled;
                }
            }
        }

        info!(run_id = %run.run_id, "run succeeded");
        RunResult::Succeeded
    }

    async fn run_stage(
        &self,
        run: &RunContext,
        stage: &StageSpec,
        cancel: &mut watch::Receiver<bool>,
    ) -> StageOutcome {
        // Resolve every input before anything in the stage starts.
        let mut resolved: BTreeMap<&str, Vec<Arc<ArtifactHandle>>> = BTreeMap::new();
        for action in &stage.actions {
            let mut inputs = Vec::with_capacity(action.inputs.len());
            for name in &action.inputs {
                match self.artifacts.get(&run.run_id, name) {
                    Ok(handle) => inputs.push(handle),
                    Err(_) => {
                        let err = PipelineError::MissingArtifact {
                            stage: stage.name.clone(),
                            action: action.name.clone(),
                            artifact: name.clone(),
                        };
                        return StageOutcome::Failed {
                            action: action.name.clone(),
                            cause: err.to_string(),
                        };
                    }
                }
            }
            resolved.insert(&action.name, inputs);
        }

        let mut produced: Vec<(String, Vec<u8>)> = Vec::new();
        for (order, group) in stage.groups() {
            debug!(run_id = %run.run_id, stage = %stage.name, run_order = order, actions = group.len(), "starting action group");

            let mut set = JoinSet::new();
            let mut names: HashMap<task::Id, String> = HashMap::new();
            for action in group {
                let executor = match self.executors.get(action.kind) {
                    Ok(executor) => executor,
                    Err(e) => {
                        set.abort_all();
                        return StageOutcome::Failed {
                            action: action.name.clone(),
                            cause: e.to_string(),
                        };
                    }
                };
                let ctx = ActionContext {
                    run_id: run.run_id.clone(),
                    pipeline: run.pipeline.clone(),
                    stage: stage.name.clone(),
                    trigger: run.trigger.clone(),
                    inputs: resolved.remove(action.name.as_str()).unwrap_or_default(),
                    artifacts: self.artifacts.clone(),
                };
                let action = action.clone();
                let name = action.name.clone();
                let handle = set.spawn(async move {
                    let result = executor.execute(&ctx, &action).await;
                    (action, result)
                });
                names.insert(handle.id(), name);
            }

            loop {
                tokio::select! {
                    biased;
                    _ = cancelled(cancel) => {
                        set.abort_all();
                        while set.join_next().await.is_some() {}
                        return StageOutcome::Cancelled;
                    }
                    joined = set.join_next_with_id() => {
                        let Some(joined) = joined else { break };
                        let failure = match joined {
                            Ok((_, (action, Ok(output)))) => match check_outputs(&action, output) {
                                Ok(outputs) => {
                                    debug!(run_id = %run.run_id, stage = %stage.name, action = %action.name, "action succeeded");
                                    produced.extend(outputs);
                                    None
                                }
                                Err(cause) => Some((action.name, cause)),
                            },
                            Ok((_, (action, Err(e)))) => Some((action.name, e.to_string())),
                            Err(e) => {
                                let action = names.remove(&e.id()).unwrap_or_default();
                                let cause = if e.is_panic() {
                                    "action panicked".to_string()
                                } else {
                                    format!("action task failed: {e}")
                                };
                                Some((action, cause))
                            }
                        };
                        if let Some((action, cause)) = failure {
                            if !set.is_empty() {
                                warn!(run_id = %run.run_id, stage = %stage.name, siblings = set.len(), "cancelling sibling actions");
                            }
                            set.abort_all();
                            while set.join_next().await.is_some() {}
                            return StageOutcome::Failed { action, cause };
                        }
                    }
                }
            }
        }

        for (name, payload) in produced {
            if let Err(e) = self
                .artifacts
                .put(&run.run_id, &name, &stage.name, &payload)
                .await
            {
                return StageOutcome::Failed {
                    action: format!("<commit {name}>"),
                    cause: e.to_string(),
                };
            }
        }
        StageOutcome::Succeeded
    }
}

/// Keep declared outputs; a missing one fails the action.
fn check_outputs(action: &ActionSpec, mut output: ActionOutput) -> Result<Vec<(String, Vec<u8>)>, String> {
    let mut outputs = Vec::with_capacity(action.outputs.len());
    for name in &action.outputs {
        match output.artifacts.remove(name) {
            Some(payload) => outputs.push((name.clone(), payload)),
            None => return Err(format!("action did not produce declared output {name}")),
        }
    }
    for extra in output.artifacts.keys() {
        warn!(action = %action.name, artifact = %extra, "ignoring undeclared output");
    }
    Ok(outputs)
}

/// Resolve once cancellation is requested; never if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use cutover_core::ActionKind;

    use super::*;
    use crate::action::{ActionExecutor, ActionSettings};
    use crate::artifact::InMemoryBlobStore;

    /// Sleeps, then succeeds or fails by action name. Records what ran.
    #[derive(Default)]
    struct Scripted {
        fail: HashSet<String>,
        panic: HashSet<String>,
        delay: BTreeMap<String, Duration>,
        started: Mutex<Vec<(String, Duration)>>,
        finished: Mutex<Vec<String>>,
        origin: Mutex<Option<Instant>>,
    }

    impl Scripted {
        fn failing(mut self, name: &str) -> Self {
            self.fail.insert(name.to_string());
            self
        }

        fn panicking(mut self, name: &str) -> Self {
            self.panic.insert(name.to_string());
            self
        }

        fn slow(mut self, name: &str, secs: u64) -> Self {
            self.delay.insert(name.to_string(), Duration::from_secs(secs));
            self
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
        }

        fn started_at(&self, name: &str) -> Duration {
            self.started
                .lock()
                .unwrap()
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, at)| *at)
                .unwrap()
        }
    }

    #[async_trait]
    impl ActionExecutor for Scripted {
        async fn execute(&self, _ctx: &ActionContext, action: &ActionSpec) -> PipelineResult<ActionOutput> {
            let origin = *self.origin.lock().unwrap().get_or_insert_with(Instant::now);
            self.started
                .lock()
                .unwrap()
                .push((action.name.clone(), origin.elapsed()));
            if let Some(delay) = self.delay.get(&action.name) {
                tokio::time::sleep(*delay).await;
            }
            if self.panic.contains(&action.name) {
                panic!("{} hit a bug", action.name);
            }
            if self.fail.contains(&action.name) {
                return Err(PipelineError::ActionFailed(format!("{} exploded", action.name)));
            }
            self.finished.lock().unwrap().push(action.name.clone());
            Ok(ActionOutput::for_outputs(action, action.name.as_bytes()))
        }
    }

    fn action(name: &str, run_order: u32, inputs: &[&str], outputs: &[&str]) -> ActionSpec {
        ActionSpec {
            name: name.to_string(),
            kind: ActionKind::Build,
            run_order,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            settings: ActionSettings::Build {
                commands: vec!["true".to_string()],
                working_dir: None,
                timeout: None,
            },
        }
    }

    fn stage(name: &str, actions: Vec<ActionSpec>) -> StageSpec {
        StageSpec {
            name: name.to_string(),
            actions,
        }
    }

    fn sequencer(executor: Arc<Scripted>) -> StageSequencer {
        StageSequencer::new(
            Executors::new().with(ActionKind::Build, executor),
            ArtifactStore::new(Arc::new(InMemoryBlobStore::new())),
        )
    }

    fn run_ctx() -> RunContext {
        RunContext {
            run_id: "run-1".to_string(),
            pipeline: "shop".to_string(),
            trigger: Trigger {
                branch: "main".to_string(),
                commit: "abc123".to_string(),
            },
        }
    }

    async fn run(
        sequencer: &StageSequencer,
        stages: &[StageSpec],
    ) -> (RunResult, Vec<StageEvent>) {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = sequencer.run(&run_ctx(), stages, cancel_rx, tx).await;
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        (result, events)
    }

    #[tokio::test]
    async fn failing_test_stage_stops_before_build() {
        let executor = Arc::new(Scripted::default().failing("UnitTest"));
        let sequencer = sequencer(executor.clone());
        let stages = vec![
            stage("Source", vec![action("Checkout", 1, &[], &["source"])]),
            stage("Test", vec![action("UnitTest", 1, &["source"], &["report"])]),
            stage("Build", vec![action("Compile", 1, &["source"], &["image"])]),
        ];

        let (result, events) = run(&sequencer, &stages).await;
        assert_eq!(
            result,
            RunResult::Failed {
                stage: "Test".to_string(),
                action: "UnitTest".to_string(),
                cause: "UnitTest exploded".to_string(),
            }
        );
        assert_eq!(executor.started(), vec!["Checkout", "UnitTest"]);
        assert!(events.iter().all(|e| e.stage != "Build"));
        assert_eq!(
            events.last().unwrap(),
            &StageEvent {
                stage: "Test".to_string(),
                status: StageStatus::Failed
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_order_groups_are_concurrent_within_and_sequential_across() {
        let executor = Arc::new(
            Scripted::default()
                .slow("LintA", 10)
                .slow("LintB", 10)
                .slow("Package", 1),
        );
        let sequencer = sequencer(executor.clone());
        let stages = vec![stage(
            "Build",
            vec![
                action("Package", 2, &[], &["image"]),
                action("LintA", 1, &[], &[]),
                action("LintB", 1, &[], &[]),
            ],
        )];

        let (result, _) = run(&sequencer, &stages).await;
        assert_eq!(result, RunResult::Succeeded);
        assert!(executor.started_at("LintA") < Duration::from_secs(1));
        assert!(executor.started_at("LintB") < Duration::from_secs(1));
        assert!(executor.started_at("Package") >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn panicked_action_is_reported_by_name() {
        let executor = Arc::new(Scripted::default().panicking("Crash").slow("Steady", 50));
        let sequencer = sequencer(executor.clone());
        let stages = vec![stage(
            "Test",
            vec![action("Steady", 1, &[], &[]), action("Crash", 1, &[], &[])],
        )];

        let (result, _) = run(&sequencer, &stages).await;
        assert_eq!(
            result,
            RunResult::Failed {
                stage: "Test".to_string(),
                action: "Crash".to_string(),
                cause: "action panicked".to_string(),
            }
        );
        assert!(executor.finished.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_cancels_running_siblings() {
        let executor = Arc::new(Scripted::default().failing("Fast").slow("Slow", 100));
        let sequencer = sequencer(executor.clone());
        let stages = vec![stage(
            "Test",
            vec![action("Fast", 1, &[], &[]), action("Slow", 1, &[], &[])],
        )];

        let started = Instant::now();
        let (result, _) = run(&sequencer, &stages).await;
        assert!(matches!(result, RunResult::Failed { ref action, .. } if action == "Fast"));
        assert!(started.elapsed() < Duration::from_secs(100));
        assert!(executor.finished.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unresolved_input_fails_without_running() {
        let executor = Arc::new(Scripted::default());
        let sequencer = sequencer(executor.clone());
        let stages = vec![
            // Declares no output, so "image" never exists.
            stage("Build", vec![action("Compile", 1, &[], &[])]),
            stage("Deploy", vec![action("Ship", 1, &["image"], &[])]),
        ];

        let (result, _) = run(&sequencer, &stages).await;
        match result {
            RunResult::Failed { stage, action, cause } => {
                assert_eq!(stage, "Deploy");
                assert_eq!(action, "Ship");
                assert!(cause.contains("missing artifact image"), "{cause}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(executor.started(), vec!["Compile"]);
    }

    #[tokio::test]
    async fn outputs_of_failed_stage_are_not_committed() {
        let executor = Arc::new(Scripted::default().failing("Verify"));
        let sequencer = sequencer(executor.clone());
        let stages = vec![stage(
            "Image",
            vec![
                action("Bake", 1, &[], &["image"]),
                action("Verify", 2, &[], &[]),
            ],
        )];

        let (result, _) = run(&sequencer, &stages).await;
        assert!(matches!(result, RunResult::Failed { .. }));
        assert!(sequencer.artifacts().get("run-1", "image").is_err());
    }

    #[tokio::test]
    async fn outputs_flow_to_later_stages() {
        let executor = Arc::new(Scripted::default());
        let sequencer = sequencer(executor.clone());
        let stages = vec![
            stage("Source", vec![action("Checkout", 1, &[], &["source"])]),
            stage("Build", vec![action("Compile", 1, &["source"], &["image"])]),
        ];

        let (result, events) = run(&sequencer, &stages).await;
        assert_eq!(result, RunResult::Succeeded);
        let image = sequencer.artifacts().get("run-1", "image").unwrap();
        assert_eq!(image.producer_stage, "Build");
        assert_eq!(sequencer.artifacts().read(&image).await.unwrap(), b"Compile");
        assert_eq!(events.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_in_flight_stage() {
        let executor = Arc::new(Scripted::default().slow("Soak", 3600));
        let sequencer = Arc::new(sequencer(executor.clone()));
        let stages = vec![
            stage("Test", vec![action("Soak", 1, &[], &[])]),
            stage("Build", vec![action("Compile", 1, &[], &[])]),
        ];

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = {
            let sequencer = sequencer.clone();
            tokio::spawn(async move { sequencer.run(&run_ctx(), &stages, cancel_rx, tx).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel_tx.send_replace(true);

        assert_eq!(task.await.unwrap(), RunResult::Cancelled);
        assert_eq!(executor.started(), vec!["Soak"]);
        let mut statuses = Vec::new();
        while let Some(ev) = rx.recv().await {
            statuses.push((ev.stage, ev.status));
        }
        assert!(statuses.contains(&("Build".to_string(), StageStatus::Cancelled)));
    }

    #[tokio::test]
    async fn missing_declared_output_fails_action() {
        struct Silent;

        #[async_trait]
        impl ActionExecutor for Silent {
            async fn execute(&self, _ctx: &ActionContext, _action: &ActionSpec) -> PipelineResult<ActionOutput> {
                Ok(ActionOutput::none())
            }
        }

        let sequencer = StageSequencer::new(
            Executors::new().with(ActionKind::Build, Arc::new(Silent)),
            ArtifactStore::new(Arc::new(InMemoryBlobStore::new())),
        );
        let stages = vec![stage("Build", vec![action("Compile", 1, &[], &["image"])])];
        let (result, _) = run(&sequencer, &stages).await;
        assert!(matches!(
            result,
            RunResult::Failed { ref cause, .. } if cause.contains("declared output image")
        ));
    }
}
