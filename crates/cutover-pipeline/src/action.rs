//! Actions: what a stage runs, and the executors that run them.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use cutover_core::config::{ActionConfig, SourceConfig};
use cutover_core::{ActionKind, RunId};

use crate::artifact::{ArtifactHandle, ArtifactStore};
use crate::error::{PipelineError, PipelineResult};

/// Kind-specific settings of an action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionSettings {
    SourceCheckout {
        repository: String,
        branch: String,
    },
    Build {
        commands: Vec<String>,
        working_dir: Option<PathBuf>,
        timeout: Option<Duration>,
    },
    Approval {
        notify: Option<String>,
        timeout: Option<Duration>,
    },
    /// Both `ecs-deploy` and `blue-green-deploy`; the environment's
    /// strategy decides how traffic moves.
    Deploy { environment: String },
}

/// One action of a stage, ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    pub name: String,
    pub kind: ActionKind,
    pub run_order: u32,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub settings: ActionSettings,
}

impl ActionSpec {
    /// Build from configuration. The config is expected to be validated.
    pub fn from_config(action: &ActionConfig, source: &SourceConfig) -> PipelineResult<Self> {
        let missing = |field: &str| {
            PipelineError::Configuration(format!("action {} is missing {field}", action.name))
        };
        let timeout = action.timeout_secs.map(Duration::from_secs);

        let settings = match action.kind {
            ActionKind::SourceCheckout => ActionSettings::SourceCheckout {
                repository: source.repository.clone(),
                branch: source.branch.clone(),
            },
            ActionKind::Build => ActionSettings::Build {
                commands: action.commands.clone().ok_or_else(|| missing("commands"))?,
                working_dir: action.working_dir.as_ref().map(PathBuf::from),
                timeout,
            },
            ActionKind::Approval => ActionSettings::Approval {
                notify: action.notify.clone(),
                timeout,
            },
            ActionKind::EcsDeploy | ActionKind::BlueGreenDeploy => ActionSettings::Deploy {
                environment: action
                    .environment
                    .clone()
                    .ok_or_else(|| missing("environment"))?,
            },
        };

        Ok(Self {
            name: action.name.clone(),
            kind: action.kind,
            run_order: action.run_order,
            inputs: action.inputs.clone(),
            outputs: action.outputs.clone(),
            settings,
        })
    }
}

/// What triggered a run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Trigger {
    pub branch: String,
    pub commit: String,
}

/// Everything an executor may look at while running one action.
#[derive(Clone)]
pub struct ActionContext {
    pub run_id: RunId,
    pub pipeline: String,
    pub stage: String,
    pub trigger: Trigger,
    /// Resolved input artifacts, in declaration order.
    pub inputs: Vec<Arc<ArtifactHandle>>,
    pub artifacts: ArtifactStore,
}

impl ActionContext {
    pub fn input(&self, name: &str) -> Option<&Arc<ArtifactHandle>> {
        self.inputs.iter().find(|h| h.name == name)
    }
}

/// Payloads an action produced, by output artifact name.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ActionOutput {
    pub artifacts: BTreeMap<String, Vec<u8>>,
}

impl ActionOutput {
    pub fn none() -> Self {
        Self::default()
    }

    /// The same payload under every declared output name.
    pub fn for_outputs(action: &ActionSpec, payload: &[u8]) -> Self {
        Self {
            artifacts: action
                .outputs
                .iter()
                .map(|name| (name.clone(), payload.to_vec()))
                .collect(),
        }
    }
}

/// Runs actions of one or more kinds.
///
/// An `Err` is an action failure; its message is surfaced verbatim as the
/// run's failure cause. Executors must tolerate being dropped mid-flight,
/// which is how sibling failures and run cancellation reach them.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, ctx: &ActionContext, action: &ActionSpec) -> PipelineResult<ActionOutput>;
}

/// Executors by action kind.
#[derive(Clone, Default)]
pub struct Executors {
    by_kind: HashMap<ActionKind, Arc<dyn ActionExecutor>>,
}

impl Executors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ActionKind, executor: Arc<dyn ActionExecutor>) -> Self {
        self.by_kind.insert(kind, executor);
        self
    }

    pub fn get(&self, kind: ActionKind) -> PipelineResult<Arc<dyn ActionExecutor>> {
        self.by_kind
            .get(&kind)
            .cloned()
            .ok_or(PipelineError::NoExecutor(kind))
    }
}
