//! Traffic shift controller.
//!
//! Drives one [`Deployment`] against a target group pair until it reaches
//! a terminal phase. The controller is the only writer of the pair's
//! listener weights while it runs.
//!
//! # Lifecycle (blue/green)
//!
//! 1. Register the revision's targets in the green group, keep the
//!    production listener all blue, point the test listener at green.
//! 2. Poll green health every `health_check_interval` until the healthy
//!    threshold is met, or fail when the validation timeout expires.
//! 3. On every shift tick move `increment_percent` of traffic to green and
//!    re-check health. Ticks are held while the latest check is not
//!    healthy; crossing the unhealthy threshold rolls back immediately.
//! 4. At 100% green with health sustained, deregister blue and complete.
//!
//! An abort request at any point before finalizing rolls back.

use std::future::pending;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use cutover_health::{HealthSource, HealthTracker, check_group};
use cutover_routing::{
    ListenerRole, RoutingError, Target, TargetGroupPair, TargetRegistry, WeightSplit,
};
use cutover_state::{DeploymentPhase, DeploymentRecord, FailureCause, HealthStatus};

use crate::deployment::Deployment;
use crate::error::{RolloutError, RolloutResult};
use crate::strategy::{DeploymentStrategy, ShiftConfig};

/// How a waiting phase ended.
enum Outcome {
    Proceed,
    Rollback(FailureCause),
    Fail(FailureCause),
}

pub struct TrafficShiftController {
    deployment: Deployment,
    pair: TargetGroupPair,
    strategy: DeploymentStrategy,
    registry: Arc<dyn TargetRegistry>,
    health: Arc<dyn HealthSource>,
    /// Targets of the revision being rolled out.
    targets: Vec<Target>,
    status: watch::Sender<DeploymentRecord>,
    abort: watch::Receiver<Option<String>>,
}

impl TrafficShiftController {
    pub fn new(
        deployment: Deployment,
        pair: TargetGroupPair,
        strategy: DeploymentStrategy,
        registry: Arc<dyn TargetRegistry>,
        health: Arc<dyn HealthSource>,
        targets: Vec<Target>,
        abort: watch::Receiver<Option<String>>,
    ) -> Self {
        let (status, _) = watch::channel(deployment.record());
        Self {
            deployment,
            pair,
            strategy,
            registry,
            health,
            targets,
            status,
            abort,
        }
    }

    /// Status updates, one per phase change or weight change.
    pub fn subscribe(&self) -> watch::Receiver<DeploymentRecord> {
        self.status.subscribe()
    }

    /// Run the deployment to a terminal phase and return its final record.
    pub async fn run(mut self) -> DeploymentRecord {
        info!(
            group = %self.deployment.group(),
            attempt = self.deployment.attempt(),
            strategy = self.strategy.label(),
            targets = self.targets.len(),
            "deployment started"
        );

        let result = match self.strategy.clone() {
            DeploymentStrategy::Simple => self.run_simple().await,
            DeploymentStrategy::BlueGreen(cfg) => self.run_blue_green(&cfg).await,
        };
        if let Err(e) = result {
            error!(
                group = %self.deployment.group(),
                attempt = self.deployment.attempt(),
                phase = %self.deployment.phase(),
                error = %e,
                "deployment driver error"
            );
            self.settle_after_error(e).await;
        }

        let record = self.deployment.record();
        info!(
            group = %record.group,
            attempt = record.attempt,
            phase = %record.phase,
            green_weight = record.green_weight,
            failure = ?record.failure,
            "deployment finished"
        );
        record
    }

    async fn run_simple(&mut self) -> RolloutResult<()> {
        if let Some(reason) = self.pending_abort() {
            return self.roll_back(FailureCause::Aborted { reason }).await;
        }
        if let Err(e) = self.route_all_to_green().await {
            return self
                .roll_back(FailureCause::Infrastructure {
                    detail: e.to_string(),
                })
                .await;
        }
        self.deployment.cut_over()?;
        self.publish();
        self.finalize().await
    }

    async fn run_blue_green(&mut self, cfg: &ShiftConfig) -> RolloutResult<()> {
        if let Some(reason) = self.pending_abort() {
            return self.roll_back(FailureCause::Aborted { reason }).await;
        }
        if let Err(e) = self.prepare_green().await {
            return self
                .roll_back(FailureCause::Infrastructure {
                    detail: e.to_string(),
                })
                .await;
        }
        self.deployment.begin_validation()?;
        self.publish();

        let mut tracker = HealthTracker::new(cfg.healthy_threshold, cfg.unhealthy_threshold);
        match self.validate(cfg, &mut tracker).await {
            Outcome::Proceed => {}
            Outcome::Rollback(cause) => return self.roll_back(cause).await,
            Outcome::Fail(cause) => return self.fail_validation(cause).await,
        }

        self.deployment.begin_shifting()?;
        self.publish();
        match self.shift(cfg, &mut tracker).await {
            Outcome::Proceed => self.finalize().await,
            Outcome::Rollback(cause) | Outcome::Fail(cause) => self.roll_back(cause).await,
        }
    }

    // ── Phases ─────────────────────────────────────────────────────

    /// Green gets the new targets; production stays on blue.
    async fn prepare_green(&self) -> RolloutResult<()> {
        let pair = &self.pair;
        self.registry
            .register_targets(&pair.green, &self.targets)
            .await?;
        for (listener, role) in pair.listeners() {
            let split = match role {
                ListenerRole::Production => WeightSplit::all_blue(),
                ListenerRole::Test => WeightSplit::all_green(),
            };
            self.registry
                .bind_listener(listener, role, &pair.blue, &pair.green, split)
                .await?;
        }
        Ok(())
    }

    async fn route_all_to_green(&self) -> RolloutResult<()> {
        let pair = &self.pair;
        self.registry
            .register_targets(&pair.green, &self.targets)
            .await?;
        for (listener, role) in pair.listeners() {
            self.registry
                .bind_listener(listener, role, &pair.blue, &pair.green, WeightSplit::all_green())
                .await?;
        }
        Ok(())
    }

    async fn validate(&self, cfg: &ShiftConfig, tracker: &mut HealthTracker) -> Outcome {
        let mut abort = self.abort.clone();
        let deadline = time::sleep(cfg.validation_timeout());
        tokio::pin!(deadline);
        let mut checks = time::interval(cfg.health_check_interval());
        checks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                reason = abort_requested(&mut abort) => {
                    return Outcome::Rollback(FailureCause::Aborted { reason });
                }
                _ = &mut deadline => {
                    warn!(
                        group = %self.deployment.group(),
                        attempt = self.deployment.attempt(),
                        timeout_secs = cfg.validation_timeout_secs,
                        successes = tracker.consecutive_successes(),
                        "green did not become healthy in time"
                    );
                    return Outcome::Fail(FailureCause::ValidationTimeout);
                }
                _ = checks.tick() => {
                    let observed = self.observe_green().await;
                    if tracker.record(observed) == HealthStatus::Healthy {
                        info!(
                            group = %self.deployment.group(),
                            attempt = self.deployment.attempt(),
                            "green validated"
                        );
                        return Outcome::Proceed;
                    }
                }
            }
        }
    }

    async fn shift(&mut self, cfg: &ShiftConfig, tracker: &mut HealthTracker) -> Outcome {
        let mut abort = self.abort.clone();
        let mut ticks = time::interval(cfg.interval());
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let every = cfg.health_check_interval();
        let mut checks = time::interval_at(Instant::now() + every, every);
        checks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stalled = 0u32;

        loop {
            tokio::select! {
                biased;
                reason = abort_requested(&mut abort) => {
                    return Outcome::Rollback(FailureCause::Aborted { reason });
                }
                _ = ticks.tick() => {
                    if tracker.last() != HealthStatus::Healthy {
                        stalled += 1;
                        debug!(
                            group = %self.deployment.group(),
                            stalled,
                            last = ?tracker.last(),
                            "holding shift until green is healthy"
                        );
                        if stalled > cfg.max_stalled_ticks {
                            warn!(
                                group = %self.deployment.group(),
                                attempt = self.deployment.attempt(),
                                stalled,
                                green_weight = self.deployment.split().green(),
                                "shift stalled"
                            );
                            return Outcome::Rollback(FailureCause::ShiftStalled);
                        }
                    } else {
                        stalled = 0;
                        if self.deployment.split().green() < 100 {
                            if let Err(e) = self.apply_increment(cfg.increment_percent).await {
                                return Outcome::Rollback(FailureCause::Infrastructure {
                                    detail: e.to_string(),
                                });
                            }
                        }
                        let observed = self.observe_green().await;
                        if tracker.record(observed) == HealthStatus::Unhealthy {
                            return Outcome::Rollback(FailureCause::HealthRegression);
                        }
                        if observed == HealthStatus::Healthy && self.deployment.split().green() == 100 {
                            return Outcome::Proceed;
                        }
                    }
                }
                _ = checks.tick() => {
                    let observed = self.observe_green().await;
                    if tracker.record(observed) == HealthStatus::Unhealthy {
                        return Outcome::Rollback(FailureCause::HealthRegression);
                    }
                }
            }
        }
    }

    async fn apply_increment(&mut self, step: u32) -> RolloutResult<()> {
        let next = self.deployment.split().shifted(step);
        self.registry.set_weights(&self.pair.listener, next).await?;
        let split = self.deployment.shift(step)?;
        info!(
            group = %self.deployment.group(),
            attempt = self.deployment.attempt(),
            blue_weight = split.blue(),
            green_weight = split.green(),
            "traffic shifted"
        );
        self.publish();
        Ok(())
    }

    async fn finalize(&mut self) -> RolloutResult<()> {
        if self.deployment.phase() != DeploymentPhase::Finalizing {
            self.deployment.begin_finalizing()?;
            self.publish();
        }
        match self.registry.deregister_all(&self.pair.blue).await {
            Ok(removed) => info!(
                group = %self.pair.blue,
                count = removed.len(),
                "blue targets deregistered"
            ),
            Err(e) => warn!(group = %self.pair.blue, error = %e, "could not deregister blue targets"),
        }
        self.deployment.complete()?;
        self.publish();
        Ok(())
    }

    async fn fail_validation(&mut self, cause: FailureCause) -> RolloutResult<()> {
        self.release_green().await;
        let split = self.deployment.split();
        self.deployment.fail(cause, split)?;
        self.publish();
        Ok(())
    }

    /// Put all traffic back on blue and release green.
    ///
    /// If blue cannot take the traffic back, the deployment fails with
    /// `RollbackIncomplete` and the weights are left as they are.
    async fn roll_back(&mut self, cause: FailureCause) -> RolloutResult<()> {
        let original = cause.to_string();
        self.deployment.begin_rollback(cause)?;
        self.publish();

        if let Err(detail) = self.restore_blue().await {
            error!(
                group = %self.deployment.group(),
                attempt = self.deployment.attempt(),
                green_weight = self.deployment.split().green(),
                %detail,
                "rollback could not restore blue, manual intervention required"
            );
            let split = self.deployment.split();
            self.deployment.fail(
                FailureCause::RollbackIncomplete {
                    detail: format!("{original}; {detail}"),
                },
                split,
            )?;
            self.publish();
            return Ok(());
        }

        self.release_green().await;
        self.deployment.rolled_back()?;
        self.publish();
        Ok(())
    }

    /// Checks the listener itself, which can be ahead of the recorded
    /// split when a bind fails partway.
    async fn restore_blue(&self) -> Result<(), String> {
        let live = match self.registry.weights(&self.pair.listener).await {
            Ok(split) => split,
            // Never bound, so green never saw traffic.
            Err(RoutingError::UnknownListener(_)) => return Ok(()),
            Err(e) => return Err(e.to_string()),
        };
        if live.green() == 0 && self.deployment.split().green() == 0 {
            return Ok(());
        }
        let blue = &self.pair.blue;
        let targets = self.registry.targets(blue).await.map_err(|e| e.to_string())?;
        if targets.is_empty() {
            return Err(format!("blue group {blue} has no registered targets"));
        }
        self.registry
            .set_weights(&self.pair.listener, WeightSplit::all_blue())
            .await
            .map_err(|e| e.to_string())
    }

    /// Best effort: point the test listener back at blue and drop green targets.
    async fn release_green(&self) {
        if let Some(test) = &self.pair.test_listener {
            if let Err(e) = self.registry.set_weights(test, WeightSplit::all_blue()).await {
                warn!(listener = %test, error = %e, "could not reset test listener");
            }
        }
        if let Err(e) = self.registry.deregister_all(&self.pair.green).await {
            warn!(group = %self.pair.green, error = %e, "could not deregister green targets");
        }
    }

    async fn settle_after_error(&mut self, err: RolloutError) {
        let cause = FailureCause::Infrastructure {
            detail: err.to_string(),
        };
        let settled = match self.deployment.phase() {
            DeploymentPhase::Initializing
            | DeploymentPhase::Validating
            | DeploymentPhase::Shifting => self.roll_back(cause).await,
            DeploymentPhase::RollingBack => {
                let split = self.deployment.split();
                self.deployment.fail(cause, split)
            }
            _ => Ok(()),
        };
        if let Err(e) = settled {
            error!(
                group = %self.deployment.group(),
                phase = %self.deployment.phase(),
                error = %e,
                "could not settle deployment"
            );
        }
        self.publish();
    }

    // ── Helpers ────────────────────────────────────────────────────

    /// Probe green and publish the result on the registry.
    ///
    /// Anything that prevents evaluation counts as unhealthy.
    async fn observe_green(&self) -> HealthStatus {
        let green = &self.pair.green;
        let status = match self.registry.targets(green).await {
            Ok(targets) => check_group(self.health.as_ref(), green, &targets).await,
            Err(e) => {
                warn!(group = %green, error = %e, "could not list green targets");
                HealthStatus::Unhealthy
            }
        };
        if let Err(e) = self.registry.record_health(green, status).await {
            debug!(group = %green, error = %e, "could not record health");
        }
        debug!(group = %green, status = ?status, "green health");
        status
    }

    fn pending_abort(&self) -> Option<String> {
        self.abort.borrow().clone()
    }

    fn publish(&self) {
        self.status.send_replace(self.deployment.record());
    }
}

/// Resolve with the abort reason once one is set.
async fn abort_requested(abort: &mut watch::Receiver<Option<String>>) -> String {
    loop {
        let current = abort.borrow_and_update().clone();
        if let Some(reason) = current {
            return reason;
        }
        if abort.changed().await.is_err() {
            return pending().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cutover_health::{MemoryHealthSource, ProbeResult};
    use cutover_routing::WeightedRouter;

    use super::*;

    const LISTENER: &str = "alb:80";
    const TEST_LISTENER: &str = "alb:9000";

    fn pair() -> TargetGroupPair {
        TargetGroupPair {
            service: "api".to_string(),
            listener: LISTENER.to_string(),
            test_listener: Some(TEST_LISTENER.to_string()),
            blue: "tg-blue".to_string(),
            green: "tg-green".to_string(),
        }
    }

    fn config() -> ShiftConfig {
        ShiftConfig {
            increment_percent: 10,
            interval_secs: 60,
            validation_timeout_secs: 300,
            health_check_interval_secs: 10,
            healthy_threshold: 1,
            unhealthy_threshold: 2,
            max_stalled_ticks: 5,
        }
    }

    async fn router(with_blue: bool) -> WeightedRouter {
        let router = WeightedRouter::new();
        router.create_group("tg-blue", "http", 8080).await;
        router.create_group("tg-green", "http", 8080).await;
        if with_blue {
            router
                .register_targets("tg-blue", &[Target::new("10.0.0.1", 8080)])
                .await
                .unwrap();
        }
        for (listener, role) in pair().listeners() {
            router
                .bind_listener(listener, role, "tg-blue", "tg-green", WeightSplit::all_blue())
                .await
                .unwrap();
        }
        router
    }

    /// Delegates to a router but refuses to bind the test listener.
    struct BrokenTestListener {
        inner: WeightedRouter,
    }

    #[async_trait::async_trait]
    impl TargetRegistry for BrokenTestListener {
        async fn register_targets(
            &self,
            group: &str,
            targets: &[Target],
        ) -> cutover_routing::RoutingResult<()> {
            self.inner.register_targets(group, targets).await
        }

        async fn deregister_all(&self, group: &str) -> cutover_routing::RoutingResult<Vec<Target>> {
            self.inner.deregister_all(group).await
        }

        async fn targets(&self, group: &str) -> cutover_routing::RoutingResult<Vec<Target>> {
            self.inner.targets(group).await
        }

        async fn group(
            &self,
            group: &str,
        ) -> cutover_routing::RoutingResult<cutover_routing::TargetGroup> {
            self.inner.group(group).await
        }

        async fn bind_listener(
            &self,
            listener: &str,
            role: ListenerRole,
            blue: &str,
            green: &str,
            split: WeightSplit,
        ) -> cutover_routing::RoutingResult<()> {
            if role == ListenerRole::Test {
                return Err(RoutingError::Backend("listener quota exceeded".to_string()));
            }
            self.inner.bind_listener(listener, role, blue, green, split).await
        }

        async fn set_weights(
            &self,
            listener: &str,
            split: WeightSplit,
        ) -> cutover_routing::RoutingResult<()> {
            self.inner.set_weights(listener, split).await
        }

        async fn weights(&self, listener: &str) -> cutover_routing::RoutingResult<WeightSplit> {
            self.inner.weights(listener).await
        }

        async fn record_health(
            &self,
            group: &str,
            health: HealthStatus,
        ) -> cutover_routing::RoutingResult<()> {
            self.inner.record_health(group, health).await
        }
    }

    fn controller(
        router: &WeightedRouter,
        health: &MemoryHealthSource,
        strategy: DeploymentStrategy,
    ) -> (TrafficShiftController, watch::Sender<Option<String>>) {
        let (abort_tx, abort_rx) = watch::channel(None);
        let controller = TrafficShiftController::new(
            Deployment::new("prod", "api", 1, "rev-2", strategy.label()),
            pair(),
            strategy,
            Arc::new(router.clone()),
            Arc::new(health.clone()),
            vec![Target::new("10.0.1.1", 8080), Target::new("10.0.1.2", 8080)],
            abort_rx,
        );
        (controller, abort_tx)
    }

    /// Collect every published record until the controller finishes.
    fn record_statuses(
        controller: &TrafficShiftController,
    ) -> tokio::task::JoinHandle<Vec<DeploymentRecord>> {
        let mut rx = controller.subscribe();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                seen.push(rx.borrow_and_update().clone());
            }
            seen
        })
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_health_completes_all_green() {
        let router = router(true).await;
        let health = MemoryHealthSource::new();
        health.set_group("tg-green", ProbeResult::Healthy).await;

        let (controller, _abort) =
            controller(&router, &health, DeploymentStrategy::BlueGreen(config()));
        let record = controller.run().await;

        assert_eq!(record.phase, DeploymentPhase::Completed);
        assert_eq!(record.green_weight, 100);
        assert_eq!(record.blue_weight, 0);
        assert!(record.failure.is_none());
        assert_eq!(router.weights(LISTENER).await.unwrap(), WeightSplit::all_green());
        assert!(router.targets("tg-blue").await.unwrap().is_empty());
        assert_eq!(router.targets("tg-green").await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn health_regression_rolls_back_without_further_increments() {
        let router = router(true).await;
        let health = MemoryHealthSource::new();
        health.set_group("tg-green", ProbeResult::Healthy).await;

        let (controller, _abort) =
            controller(&router, &health, DeploymentStrategy::BlueGreen(config()));
        let statuses = record_statuses(&controller);
        let task = tokio::spawn(controller.run());

        // Shift ticks at t=0, 60, 120 put green at 30.
        time::sleep(Duration::from_secs(125)).await;
        health.set_group("tg-green", ProbeResult::Unhealthy).await;

        let record = task.await.unwrap();
        assert_eq!(record.phase, DeploymentPhase::RolledBack);
        assert_eq!(record.failure, Some(FailureCause::HealthRegression));
        assert_eq!(record.green_weight, 0);

        let seen = statuses.await.unwrap();
        let max_green = seen.iter().map(|r| r.green_weight).max().unwrap();
        assert_eq!(max_green, 30);
        assert_eq!(seen.last().unwrap().phase, DeploymentPhase::RolledBack);

        assert_eq!(router.weights(LISTENER).await.unwrap(), WeightSplit::all_blue());
        assert_eq!(router.weights(TEST_LISTENER).await.unwrap(), WeightSplit::all_blue());
        assert!(router.targets("tg-green").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_while_shifting_rolls_back() {
        let router = router(true).await;
        let health = MemoryHealthSource::new();
        health.set_group("tg-green", ProbeResult::Healthy).await;

        let (controller, abort) =
            controller(&router, &health, DeploymentStrategy::BlueGreen(config()));
        let task = tokio::spawn(controller.run());

        time::sleep(Duration::from_secs(90)).await;
        abort.send_replace(Some("operator".to_string()));

        let record = task.await.unwrap();
        assert_eq!(record.phase, DeploymentPhase::RolledBack);
        assert_eq!(
            record.failure,
            Some(FailureCause::Aborted {
                reason: "operator".to_string()
            })
        );
        assert_eq!(router.weights(LISTENER).await.unwrap(), WeightSplit::all_blue());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_before_start_never_registers_green() {
        let router = router(true).await;
        let health = MemoryHealthSource::new();
        let (controller, abort) =
            controller(&router, &health, DeploymentStrategy::BlueGreen(config()));
        abort.send_replace(Some("changed my mind".to_string()));

        let record = controller.run().await;
        assert_eq!(record.phase, DeploymentPhase::RolledBack);
        assert!(router.targets("tg-green").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn validation_timeout_fails_and_releases_green() {
        let router = router(true).await;
        // No health configured for green: every probe fails.
        let health = MemoryHealthSource::new();

        let (controller, _abort) =
            controller(&router, &health, DeploymentStrategy::BlueGreen(config()));
        let started = Instant::now();
        let record = controller.run().await;

        assert!(started.elapsed() >= Duration::from_secs(300));
        assert!(started.elapsed() < Duration::from_secs(301));
        assert_eq!(record.phase, DeploymentPhase::Failed);
        assert_eq!(record.failure, Some(FailureCause::ValidationTimeout));
        assert_eq!(record.green_weight, 0);
        assert!(router.targets("tg-green").await.unwrap().is_empty());
        assert_eq!(router.weights(TEST_LISTENER).await.unwrap(), WeightSplit::all_blue());
        assert_eq!(router.targets("tg-blue").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_health_source_fails_closed() {
        let router = router(true).await;
        let health = MemoryHealthSource::new();
        health.set_group("tg-green", ProbeResult::Healthy).await;
        health.set_unavailable("tg-green", "lb api throttled").await;

        let (controller, _abort) =
            controller(&router, &health, DeploymentStrategy::BlueGreen(config()));
        let record = controller.run().await;

        assert_eq!(record.failure, Some(FailureCause::ValidationTimeout));
        assert_eq!(
            router.group("tg-green").await.unwrap().health,
            HealthStatus::Unknown
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_without_blue_targets_is_incomplete() {
        let router = router(false).await;
        let health = MemoryHealthSource::new();
        health.set_group("tg-green", ProbeResult::Healthy).await;

        let (controller, abort) =
            controller(&router, &health, DeploymentStrategy::BlueGreen(config()));
        let task = tokio::spawn(controller.run());

        time::sleep(Duration::from_secs(65)).await;
        abort.send_replace(Some("operator".to_string()));

        let record = task.await.unwrap();
        assert_eq!(record.phase, DeploymentPhase::Failed);
        assert!(matches!(
            record.failure,
            Some(FailureCause::RollbackIncomplete { .. })
        ));
        assert_eq!(record.green_weight, 20);
        // Green keeps serving what it had.
        assert_eq!(router.weights(LISTENER).await.unwrap().green(), 20);
        assert_eq!(router.targets("tg-green").await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn held_shift_ticks_eventually_stall() {
        let router = router(true).await;
        let health = MemoryHealthSource::new();
        health.set_group("tg-green", ProbeResult::Healthy).await;

        let cfg = ShiftConfig {
            unhealthy_threshold: 1000,
            ..config()
        };
        let (controller, _abort) = controller(&router, &health, DeploymentStrategy::BlueGreen(cfg));
        let task = tokio::spawn(controller.run());

        time::sleep(Duration::from_secs(5)).await;
        health.set_group("tg-green", ProbeResult::Unhealthy).await;

        let record = task.await.unwrap();
        assert_eq!(record.phase, DeploymentPhase::RolledBack);
        assert_eq!(record.failure, Some(FailureCause::ShiftStalled));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_cutover_failure_puts_production_back_on_blue() {
        let router = router(true).await;
        let health = MemoryHealthSource::new();
        let (_, abort_rx) = watch::channel(None);
        let controller = TrafficShiftController::new(
            Deployment::new("prod", "api", 1, "rev-2", "simple"),
            pair(),
            DeploymentStrategy::Simple,
            Arc::new(BrokenTestListener {
                inner: router.clone(),
            }),
            Arc::new(health),
            vec![Target::new("10.0.1.1", 8080)],
            abort_rx,
        );

        let record = controller.run().await;
        assert_eq!(record.phase, DeploymentPhase::RolledBack);
        assert!(matches!(
            record.failure,
            Some(FailureCause::Infrastructure { ref detail }) if detail.contains("quota")
        ));
        assert_eq!(router.weights(LISTENER).await.unwrap(), WeightSplit::all_blue());
        assert_eq!(router.group("tg-blue").await.unwrap().weight, 100);
        assert!(router.targets("tg-green").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn validation_keeps_blue_weight_while_test_listener_is_green() {
        let router = router(true).await;
        let health = MemoryHealthSource::new();

        let (controller, abort) =
            controller(&router, &health, DeploymentStrategy::BlueGreen(config()));
        let task = tokio::spawn(controller.run());
        time::sleep(Duration::from_secs(5)).await;

        assert_eq!(router.weights(TEST_LISTENER).await.unwrap(), WeightSplit::all_green());
        assert_eq!(router.group("tg-blue").await.unwrap().weight, 100);
        assert_eq!(router.group("tg-green").await.unwrap().weight, 0);

        abort.send_replace(Some("done looking".to_string()));
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn simple_strategy_cuts_over_at_once() {
        let router = router(true).await;
        // Simple never consults health.
        let health = MemoryHealthSource::new();

        let (controller, _abort) = controller(&router, &health, DeploymentStrategy::Simple);
        let statuses = record_statuses(&controller);
        let started = Instant::now();
        let record = controller.run().await;

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(record.phase, DeploymentPhase::Completed);
        assert_eq!(record.green_weight, 100);
        assert_eq!(router.weights(LISTENER).await.unwrap(), WeightSplit::all_green());
        assert!(router.targets("tg-blue").await.unwrap().is_empty());

        let phases: Vec<_> = statuses.await.unwrap().iter().map(|r| r.phase).collect();
        assert!(!phases.contains(&DeploymentPhase::Shifting));
    }
}
