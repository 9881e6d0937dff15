//! Deployment groups.
//!
//! A `DeploymentGroup` binds a service's target group pair to a strategy
//! and runs at most one deployment at a time. Finished deployments are
//! archived in the state store; a completed one promotes green to blue so
//! the next deployment starts from the revision now serving traffic.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

use cutover_core::config::EnvironmentConfig;
use cutover_health::HealthSource;
use cutover_routing::{Target, TargetGroupPair, TargetRegistry, WeightSplit};
use cutover_state::{DeploymentPhase, DeploymentRecord, StateStore};

use crate::controller::TrafficShiftController;
use crate::deployment::Deployment;
use crate::error::{RolloutError, RolloutResult};
use crate::strategy::DeploymentStrategy;

/// A revision to roll out: an identifier (image digest, build id) and the
/// targets serving it.
#[derive(Debug, Clone)]
pub struct Revision {
    pub id: String,
    pub targets: Vec<Target>,
}

/// Caller's view of one running or finished deployment.
#[derive(Clone, Debug)]
pub struct DeploymentHandle {
    group: String,
    attempt: u64,
    status: watch::Receiver<DeploymentRecord>,
    settled: watch::Receiver<bool>,
    abort: Arc<watch::Sender<Option<String>>>,
}

impl DeploymentHandle {
    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Latest published status.
    pub fn status(&self) -> DeploymentRecord {
        self.status.borrow().clone()
    }

    /// Terminal, archived, and (if completed) promoted.
    pub fn is_settled(&self) -> bool {
        *self.settled.borrow()
    }

    /// Request a rollback.
    ///
    /// A no-op on a deployment that already reached a terminal phase; the
    /// current status is returned either way. Only the first reason is kept.
    pub fn abort(&self, reason: &str) -> DeploymentRecord {
        let current = self.status();
        if current.phase.is_terminal() {
            return current;
        }
        let requested = self.abort.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(reason.to_string());
                true
            } else {
                false
            }
        });
        if requested {
            info!(group = %self.group, attempt = self.attempt, reason, "abort requested");
        }
        self.status()
    }

    /// Wait until the deployment has settled and return its final record.
    pub async fn wait(&self) -> DeploymentRecord {
        let mut settled = self.settled.clone();
        if settled.wait_for(|done| *done).await.is_err() {
            warn!(group = %self.group, attempt = self.attempt, "deployment task ended without settling");
        }
        self.status()
    }

    /// Wait until the published phase matches `pred`.
    pub async fn wait_for_phase(
        &self,
        pred: impl Fn(DeploymentPhase) -> bool,
    ) -> DeploymentRecord {
        let mut status = self.status.clone();
        match status.wait_for(|record| pred(record.phase)).await {
            Ok(record) => record.clone(),
            Err(_) => self.status(),
        }
    }
}

struct GroupInner {
    pair: TargetGroupPair,
    active: Option<DeploymentHandle>,
    next_attempt: u64,
}

/// A service, its target group pair and a strategy, deployed as one unit.
#[derive(Clone)]
pub struct DeploymentGroup {
    name: String,
    strategy: DeploymentStrategy,
    registry: Arc<dyn TargetRegistry>,
    health: Arc<dyn HealthSource>,
    store: Option<StateStore>,
    inner: Arc<Mutex<GroupInner>>,
}

impl DeploymentGroup {
    /// Create a group. Invalid strategies are rejected here, before any
    /// deployment can start.
    pub fn new(
        name: &str,
        pair: TargetGroupPair,
        strategy: DeploymentStrategy,
        registry: Arc<dyn TargetRegistry>,
        health: Arc<dyn HealthSource>,
        store: Option<StateStore>,
    ) -> RolloutResult<Self> {
        strategy.validate()?;
        let next_attempt = match &store {
            Some(store) => store.next_attempt(name)?,
            None => 1,
        };
        Ok(Self {
            name: name.to_string(),
            strategy,
            registry,
            health,
            store,
            inner: Arc::new(Mutex::new(GroupInner {
                pair,
                active: None,
                next_attempt,
            })),
        })
    }

    pub fn from_config(
        env: &EnvironmentConfig,
        registry: Arc<dyn TargetRegistry>,
        health: Arc<dyn HealthSource>,
        store: Option<StateStore>,
    ) -> RolloutResult<Self> {
        let strategy = DeploymentStrategy::try_from(&env.strategy)?;
        Self::new(
            &env.name,
            TargetGroupPair::from_config(env),
            strategy,
            registry,
            health,
            store,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> &DeploymentStrategy {
        &self.strategy
    }

    pub async fn pair(&self) -> TargetGroupPair {
        self.inner.lock().await.pair.clone()
    }

    /// Bind the listeners all blue and register the revision currently live.
    pub async fn bootstrap(&self, live: &[Target]) -> RolloutResult<()> {
        let inner = self.inner.lock().await;
        let pair = &inner.pair;
        for (listener, role) in pair.listeners() {
            self.registry
                .bind_listener(listener, role, &pair.blue, &pair.green, WeightSplit::all_blue())
                .await?;
        }
        if !live.is_empty() {
            self.registry.register_targets(&pair.blue, live).await?;
        }
        info!(
            group = %self.name,
            service = %pair.service,
            blue = %pair.blue,
            green = %pair.green,
            live_targets = live.len(),
            "deployment group ready"
        );
        Ok(())
    }

    /// Start rolling out `revision`.
    ///
    /// Fails with `DeploymentInProgress` while the previous deployment of
    /// this group has not settled; that deployment is left untouched.
    pub async fn start(&self, revision: Revision) -> RolloutResult<DeploymentHandle> {
        if revision.targets.is_empty() {
            return Err(RolloutError::Configuration(format!(
                "revision {} has no targets",
                revision.id
            )));
        }

        let mut inner = self.inner.lock().await;
        if let Some(active) = &inner.active {
            if !active.is_settled() {
                return Err(RolloutError::DeploymentInProgress {
                    group: self.name.clone(),
                    attempt: active.attempt(),
                });
            }
        }

        let attempt = inner.next_attempt;
        inner.next_attempt += 1;

        let deployment = Deployment::new(
            &self.name,
            &inner.pair.service,
            attempt,
            &revision.id,
            self.strategy.label(),
        );
        let (abort_tx, abort_rx) = watch::channel(None);
        let controller = TrafficShiftController::new(
            deployment,
            inner.pair.clone(),
            self.strategy.clone(),
            self.registry.clone(),
            self.health.clone(),
            revision.targets,
            abort_rx,
        );
        let (settled_tx, settled_rx) = watch::channel(false);
        let handle = DeploymentHandle {
            group: self.name.clone(),
            attempt,
            status: controller.subscribe(),
            settled: settled_rx,
            abort: Arc::new(abort_tx),
        };
        inner.active = Some(handle.clone());
        drop(inner);

        info!(group = %self.name, attempt, revision = %revision.id, "deployment accepted");

        let group = self.clone();
        tokio::spawn(async move {
            let record = controller.run().await;
            group.settle(record).await;
            settled_tx.send_replace(true);
        });

        Ok(handle)
    }

    /// Archive a finished deployment and promote on success.
    async fn settle(&self, record: DeploymentRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.archive_deployment(&record) {
                error!(group = %self.name, attempt = record.attempt, error = %e, "failed to archive deployment");
            }
        }
        if record.phase != DeploymentPhase::Completed {
            return;
        }

        let mut inner = self.inner.lock().await;
        inner.pair.promote();
        let pair = &inner.pair;
        for (listener, role) in pair.listeners() {
            if let Err(e) = self
                .registry
                .bind_listener(listener, role, &pair.blue, &pair.green, WeightSplit::all_blue())
                .await
            {
                error!(group = %self.name, listener = %listener, error = %e, "failed to rebind listener after promotion");
            }
        }
        info!(group = %self.name, blue = %pair.blue, green = %pair.green, "green promoted to blue");
    }

    /// The active deployment, or the most recent one if none is running.
    pub async fn active(&self) -> Option<DeploymentHandle> {
        self.inner.lock().await.active.clone()
    }

    pub async fn current_phase(&self) -> Option<DeploymentPhase> {
        self.status().await.map(|record| record.phase)
    }

    pub async fn status(&self) -> Option<DeploymentRecord> {
        self.active().await.map(|handle| handle.status())
    }

    /// Abort the current deployment. Returns its status, or `None` if the
    /// group never deployed.
    pub async fn abort(&self, reason: &str) -> Option<DeploymentRecord> {
        self.active().await.map(|handle| handle.abort(reason))
    }

    /// Archived deployments, oldest first.
    pub fn history(&self) -> RolloutResult<Vec<DeploymentRecord>> {
        match &self.store {
            Some(store) => Ok(store.list_deployments_for_group(&self.name)?),
            None => Ok(Vec::new()),
        }
    }
}
