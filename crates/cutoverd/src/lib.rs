//! cutoverd — wiring of a `cutover.toml` into running subsystems.
//!
//! [`assemble`] builds everything the daemon serves from a validated
//! configuration:
//! - Weighted router with both target groups of every environment
//! - One deployment group per environment, bootstrapped on its live targets
//! - Approval gate, executors, artifact store, stage sequencer
//! - Pipeline runner backed by the state store
//!
//! The binary in `main.rs` adds the CLI, tracing, and the HTTP server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use cutover_api::ApiState;
use cutover_core::CutoverConfig;
use cutover_core::config::EnvironmentConfig;
use cutover_health::{HealthSource, HttpHealthSource};
use cutover_pipeline::{
    ApprovalGate, ArtifactBlobStore, ArtifactStore, DeployExecutor, DeployTarget, PipelineDefinition,
    PipelineRunner, StageSequencer, standard_executors,
};
use cutover_rollout::{DeploymentGroup, DeploymentStrategy};
use cutover_routing::{Target, WeightedRouter};
use cutover_state::StateStore;

/// Everything assembled from one configuration.
pub struct Assembly {
    pub router: WeightedRouter,
    pub groups: Vec<DeploymentGroup>,
    pub gate: ApprovalGate,
    pub runner: PipelineRunner,
}

impl Assembly {
    pub fn api_state(&self) -> ApiState {
        ApiState::new(self.runner.clone(), self.gate.clone(), self.groups.clone())
    }

    pub fn api_router(&self) -> axum::Router {
        cutover_api::build_router(self.api_state())
    }
}

/// Inputs to [`assemble`] besides the configuration.
pub struct Wiring<H> {
    pub state: StateStore,
    pub blobs: Arc<dyn ArtifactBlobStore>,
    /// Health source for an environment's target groups.
    pub health: H,
    /// Base directory for relative build `working_dir`s.
    pub workspace: Option<PathBuf>,
}

/// HTTP probes using the environment's health check settings.
pub fn http_health(env: &EnvironmentConfig) -> Arc<dyn HealthSource> {
    let Some(check) = &env.health else {
        return Arc::new(HttpHealthSource::default());
    };
    Arc::new(HttpHealthSource::new(
        check.path.as_deref().unwrap_or("/healthz"),
        check
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(2)),
    ))
}

/// Check what `validate()` leaves to execution time: strategy ranges.
pub fn check_strategies(config: &CutoverConfig) -> anyhow::Result<()> {
    for env in &config.environments {
        let strategy = DeploymentStrategy::try_from(&env.strategy)
            .with_context(|| format!("environment {}", env.name))?;
        strategy
            .validate()
            .with_context(|| format!("environment {}", env.name))?;
    }
    Ok(())
}

pub async fn assemble<H>(config: &CutoverConfig, wiring: Wiring<H>) -> anyhow::Result<Assembly>
where
    H: Fn(&EnvironmentConfig) -> Arc<dyn HealthSource>,
{
    config.validate()?;
    check_strategies(config)?;

    // ── Routing and deployment groups ──────────────────────────

    let router = WeightedRouter::new();
    let mut groups = Vec::with_capacity(config.environments.len());
    let mut deploy = DeployExecutor::new();

    for env in &config.environments {
        router
            .create_group(&env.blue.id, &env.blue.protocol, env.blue.port)
            .await;
        router
            .create_group(&env.green.id, &env.green.protocol, env.green.port)
            .await;

        let group = DeploymentGroup::from_config(
            env,
            Arc::new(router.clone()),
            (wiring.health)(env),
            Some(wiring.state.clone()),
        )
        .with_context(|| format!("environment {}", env.name))?;

        let live = parse_targets(&env.live_targets)?;
        group.bootstrap(&live).await?;

        let targets = parse_targets(&env.revision_targets)?;
        deploy = deploy.with_environment(
            &env.name,
            DeployTarget {
                group: group.clone(),
                targets,
            },
        );
        groups.push(group);
    }
    info!(environments = groups.len(), "deployment groups ready");

    // ── Pipeline ───────────────────────────────────────────────

    let gate = ApprovalGate::new();
    let executors = standard_executors(gate.clone(), deploy, wiring.workspace);
    let artifacts = ArtifactStore::new(wiring.blobs).with_state(wiring.state.clone());
    let sequencer = StageSequencer::new(executors, artifacts);
    let definition = PipelineDefinition::from_config(&config.pipeline)?;
    info!(
        pipeline = %definition.name,
        repository = %definition.repository,
        branch = %definition.branch,
        stages = definition.stages.len(),
        "pipeline ready"
    );
    let runner = PipelineRunner::new(definition, sequencer, wiring.state);

    Ok(Assembly {
        router,
        groups,
        gate,
        runner,
    })
}

fn parse_targets(addrs: &[String]) -> anyhow::Result<Vec<Target>> {
    addrs
        .iter()
        .map(|addr| Target::parse(addr).map_err(anyhow::Error::from))
        .collect()
}
