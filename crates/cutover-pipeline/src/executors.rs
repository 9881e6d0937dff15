//! Built-in action executors.
//!
//! - **`SourceExecutor`** — emits a `{repository, branch, commit}` manifest
//! - **`ShellExecutor`** — runs build commands with `sh -c`
//! - **`ApprovalExecutor`** — blocks on the [`ApprovalGate`]
//! - **`DeployExecutor`** — hands a revision to a deployment group and
//!   waits for it to settle

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use cutover_core::ActionKind;
use cutover_rollout::{DeploymentGroup, DeploymentHandle, Revision};
use cutover_routing::Target;
use cutover_state::DeploymentPhase;

use crate::action::{ActionContext, ActionExecutor, ActionOutput, ActionSettings, ActionSpec, Executors};
use crate::approval::{ApprovalGate, ApprovalRequest};
use crate::error::{PipelineError, PipelineResult};

fn wrong_settings(action: &ActionSpec) -> PipelineError {
    PipelineError::Configuration(format!(
        "action {} has settings for a different kind than {}",
        action.name, action.kind
    ))
}

// ── Source ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SourceManifest<'a> {
    repository: &'a str,
    branch: &'a str,
    commit: &'a str,
}

pub struct SourceExecutor;

#[async_trait]
impl ActionExecutor for SourceExecutor {
    async fn execute(&self, ctx: &ActionContext, action: &ActionSpec) -> PipelineResult<ActionOutput> {
        let ActionSettings::SourceCheckout { repository, .. } = &action.settings else {
            return Err(wrong_settings(action));
        };
        let manifest = SourceManifest {
            repository,
            branch: &ctx.trigger.branch,
            commit: &ctx.trigger.commit,
        };
        debug!(run_id = %ctx.run_id, repository, commit = %ctx.trigger.commit, "source checked out");
        Ok(ActionOutput::for_outputs(action, &serde_json::to_vec(&manifest)?))
    }
}

// ── Shell ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct BuildManifest<'a> {
    action: &'a str,
    commit: &'a str,
    commands: &'a [String],
    inputs: BTreeMap<&'a str, &'a str>,
    stdout: String,
}

/// Runs build commands in order; the first non-zero exit fails the action.
///
/// Each command sees `CUTOVER_RUN_ID`, `CUTOVER_BRANCH`, `CUTOVER_COMMIT`,
/// and `CUTOVER_INPUT_<NAME>` with the payload location of each input.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    /// Base for relative working directories.
    workspace: Option<PathBuf>,
}

impl ShellExecutor {
    pub fn new(workspace: Option<PathBuf>) -> Self {
        Self { workspace }
    }

    async fn run_command(
        &self,
        ctx: &ActionContext,
        cmd: &str,
        dir: Option<&PathBuf>,
    ) -> PipelineResult<String> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .env("CUTOVER_RUN_ID", &ctx.run_id)
            .env("CUTOVER_BRANCH", &ctx.trigger.branch)
            .env("CUTOVER_COMMIT", &ctx.trigger.commit);
        for input in &ctx.inputs {
            command.env(input_var(&input.name), &input.payload.location);
        }
        if let Some(dir) = dir {
            command.current_dir(dir);
        }

        debug!(run_id = %ctx.run_id, stage = %ctx.stage, cmd, "running command");
        let output = command.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::ActionFailed(format!(
                "`{cmd}` exited with {}: {}",
                output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string()),
                tail(&stderr, 20)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ActionExecutor for ShellExecutor {
    async fn execute(&self, ctx: &ActionContext, action: &ActionSpec) -> PipelineResult<ActionOutput> {
        let ActionSettings::Build {
            commands,
            working_dir,
            timeout,
        } = &action.settings
        else {
            return Err(wrong_settings(action));
        };
        let dir = match (&self.workspace, working_dir) {
            (Some(base), Some(dir)) => Some(base.join(dir)),
            (None, Some(dir)) => Some(dir.clone()),
            (Some(base), None) => Some(base.clone()),
            (None, None) => None,
        };

        let run = async {
            let mut stdout = String::new();
            for cmd in commands {
                stdout.push_str(&self.run_command(ctx, cmd, dir.as_ref()).await?);
            }
            Ok::<_, PipelineError>(stdout)
        };
        let stdout = match timeout {
            Some(limit) => tokio::time::timeout(*limit, run).await.map_err(|_| {
                PipelineError::ActionFailed(format!("timed out after {}s", limit.as_secs()))
            })??,
            None => run.await?,
        };

        let manifest = BuildManifest {
            action: &action.name,
            commit: &ctx.trigger.commit,
            commands,
            inputs: ctx
                .inputs
                .iter()
                .map(|h| (h.name.as_str(), h.payload.digest.as_str()))
                .collect(),
            stdout: tail(&stdout, 50),
        };
        info!(run_id = %ctx.run_id, action = %action.name, commands = commands.len(), "build finished");
        Ok(ActionOutput::for_outputs(action, &serde_json::to_vec(&manifest)?))
    }
}

fn input_var(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("CUTOVER_INPUT_{suffix}")
}

/// Last `lines` lines of `text`.
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

// ── Approval ───────────────────────────────────────────────────────

pub struct ApprovalExecutor {
    gate: ApprovalGate,
}

impl ApprovalExecutor {
    pub fn new(gate: ApprovalGate) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl ActionExecutor for ApprovalExecutor {
    async fn execute(&self, ctx: &ActionContext, action: &ActionSpec) -> PipelineResult<ActionOutput> {
        let ActionSettings::Approval { notify, timeout } = &action.settings else {
            return Err(wrong_settings(action));
        };
        let ticket = self.gate.request(ApprovalRequest::new(
            &ctx.run_id,
            &ctx.stage,
            &action.name,
            notify.clone(),
        ))?;
        let decision = ticket.wait(*timeout).await?;
        Ok(ActionOutput::for_outputs(action, &serde_json::to_vec(&decision)?))
    }
}

// ── Deploy ─────────────────────────────────────────────────────────

/// A deployment group and the targets a new revision comes up on.
#[derive(Clone)]
pub struct DeployTarget {
    pub group: DeploymentGroup,
    pub targets: Vec<Target>,
}

/// Starts a deployment for the first input artifact and waits for it.
/// Anything but `Completed` fails the action.
#[derive(Clone, Default)]
pub struct DeployExecutor {
    environments: HashMap<String, DeployTarget>,
}

impl DeployExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_environment(mut self, name: &str, target: DeployTarget) -> Self {
        self.environments.insert(name.to_string(), target);
        self
    }
}

#[async_trait]
impl ActionExecutor for DeployExecutor {
    async fn execute(&self, ctx: &ActionContext, action: &ActionSpec) -> PipelineResult<ActionOutput> {
        let ActionSettings::Deploy { environment } = &action.settings else {
            return Err(wrong_settings(action));
        };
        let target = self.environments.get(environment).ok_or_else(|| {
            PipelineError::Configuration(format!("unknown environment {environment}"))
        })?;

        let revision = Revision {
            id: ctx
                .inputs
                .first()
                .map(|h| h.payload.digest.clone())
                .unwrap_or_else(|| format!("run-{}", ctx.run_id)),
            targets: target.targets.clone(),
        };
        let handle = target.group.start(revision).await?;
        info!(
            run_id = %ctx.run_id,
            environment = %environment,
            attempt = handle.attempt(),
            "deployment started from pipeline"
        );

        let guard = AbortOnDrop(Some(handle.clone()));
        let record = handle.wait().await;
        guard.disarm();

        if record.phase != DeploymentPhase::Completed {
            let cause = record
                .failure
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "no cause recorded".to_string());
            return Err(PipelineError::ActionFailed(format!(
                "deployment {} of {} ended {}: {cause}",
                record.attempt, record.group, record.phase
            )));
        }
        Ok(ActionOutput::for_outputs(action, &serde_json::to_vec(&record)?))
    }
}

/// Rolls the deployment back if the waiting action is dropped.
struct AbortOnDrop(Option<DeploymentHandle>);

impl AbortOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            warn!(group = %handle.group(), attempt = handle.attempt(), "pipeline action dropped, aborting deployment");
            handle.abort("pipeline action cancelled");
        }
    }
}

/// The standard executor set.
pub fn standard_executors(
    gate: ApprovalGate,
    deploy: DeployExecutor,
    workspace: Option<PathBuf>,
) -> Executors {
    let deploy = Arc::new(deploy);
    Executors::new()
        .with(ActionKind::SourceCheckout, Arc::new(SourceExecutor))
        .with(ActionKind::Build, Arc::new(ShellExecutor::new(workspace)))
        .with(ActionKind::Approval, Arc::new(ApprovalExecutor::new(gate)))
        .with(ActionKind::EcsDeploy, deploy.clone())
        .with(ActionKind::BlueGreenDeploy, deploy)
}
