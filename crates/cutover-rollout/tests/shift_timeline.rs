//! Timing and weight invariants of a blue/green shift, observed from the
//! registry side with a paused clock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use cutover_health::{HealthResult, HealthSource, ProbeResult};
use cutover_rollout::{Deployment, DeploymentStrategy, ShiftConfig, TrafficShiftController};
use cutover_routing::{
    ListenerRole, RoutingResult, Target, TargetGroup, TargetGroupPair, TargetRegistry, WeightSplit,
    WeightedRouter,
};
use cutover_state::{DeploymentPhase, HealthStatus};

const LISTENER: &str = "alb:80";

/// Wraps the in-memory router and timestamps every weight change.
#[derive(Clone)]
struct RecordingRegistry {
    inner: WeightedRouter,
    started: Instant,
    changes: Arc<Mutex<Vec<(Duration, String, WeightSplit)>>>,
}

impl RecordingRegistry {
    fn production_changes(&self) -> Vec<(Duration, WeightSplit)> {
        self.changes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, listener, _)| listener == LISTENER)
            .map(|(at, _, split)| (*at, *split))
            .collect()
    }
}

#[async_trait]
impl TargetRegistry for RecordingRegistry {
    async fn register_targets(&self, group: &str, targets: &[Target]) -> RoutingResult<()> {
        self.inner.register_targets(group, targets).await
    }

    async fn deregister_all(&self, group: &str) -> RoutingResult<Vec<Target>> {
        self.inner.deregister_all(group).await
    }

    async fn targets(&self, group: &str) -> RoutingResult<Vec<Target>> {
        self.inner.targets(group).await
    }

    async fn group(&self, group: &str) -> RoutingResult<TargetGroup> {
        self.inner.group(group).await
    }

    async fn bind_listener(
        &self,
        listener: &str,
        role: ListenerRole,
        blue: &str,
        green: &str,
        split: WeightSplit,
    ) -> RoutingResult<()> {
        self.inner.bind_listener(listener, role, blue, green, split).await
    }

    async fn set_weights(&self, listener: &str, split: WeightSplit) -> RoutingResult<()> {
        self.inner.set_weights(listener, split).await?;
        self.changes
            .lock()
            .unwrap()
            .push((self.started.elapsed(), listener.to_string(), split));
        Ok(())
    }

    async fn weights(&self, listener: &str) -> RoutingResult<WeightSplit> {
        self.inner.weights(listener).await
    }

    async fn record_health(&self, group: &str, health: HealthStatus) -> RoutingResult<()> {
        self.inner.record_health(group, health).await
    }
}

/// Replays a fixed sequence of group results, then repeats the last one.
struct ScriptedHealth {
    script: Mutex<VecDeque<ProbeResult>>,
    last: Mutex<ProbeResult>,
}

impl ScriptedHealth {
    fn new(script: &[ProbeResult]) -> Self {
        Self {
            script: Mutex::new(script.iter().copied().collect()),
            last: Mutex::new(ProbeResult::Healthy),
        }
    }
}

#[async_trait]
impl HealthSource for ScriptedHealth {
    async fn probe(&self, _group: &str, targets: &[Target]) -> HealthResult<Vec<ProbeResult>> {
        let next = self.script.lock().unwrap().pop_front();
        let result = match next {
            Some(result) => {
                *self.last.lock().unwrap() = result;
                result
            }
            None => *self.last.lock().unwrap(),
        };
        Ok(vec![result; targets.len()])
    }
}

async fn registry() -> RecordingRegistry {
    let router = WeightedRouter::new();
    router.create_group("tg-blue", "http", 8080).await;
    router.create_group("tg-green", "http", 8080).await;
    router
        .register_targets("tg-blue", &[Target::new("10.0.0.1", 8080)])
        .await
        .unwrap();
    RecordingRegistry {
        inner: router,
        started: Instant::now(),
        changes: Arc::new(Mutex::new(Vec::new())),
    }
}

fn controller(
    registry: &RecordingRegistry,
    health: Arc<dyn HealthSource>,
    cfg: ShiftConfig,
) -> (TrafficShiftController, watch::Sender<Option<String>>) {
    let pair = TargetGroupPair {
        service: "api".to_string(),
        listener: LISTENER.to_string(),
        test_listener: None,
        blue: "tg-blue".to_string(),
        green: "tg-green".to_string(),
    };
    let strategy = DeploymentStrategy::BlueGreen(cfg);
    let (abort_tx, abort_rx) = watch::channel(None);
    let controller = TrafficShiftController::new(
        Deployment::new("prod", "api", 1, "rev-2", strategy.label()),
        pair,
        strategy,
        Arc::new(registry.clone()),
        health,
        vec![Target::new("10.0.1.1", 8080)],
        abort_rx,
    );
    (controller, abort_tx)
}

fn linear_ten_per_minute() -> ShiftConfig {
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

#[tokio::test(start_paused = true)]
async fn linear_shift_reaches_full_weight_at_540_seconds() {
    let registry = registry().await;
    let (controller, _abort) = controller(
        &registry,
        Arc::new(ScriptedHealth::new(&[])),
        linear_ten_per_minute(),
    );

    let record = controller.run().await;
    assert_eq!(record.phase, DeploymentPhase::Completed);

    let changes = registry.production_changes();
    assert_eq!(changes.len(), 10);
    for (i, (at, split)) in changes.iter().enumerate() {
        assert_eq!(*at, Duration::from_secs(60 * i as u64));
        assert_eq!(split.green() as u32, 10 * (i as u32 + 1));
        assert_eq!(split.blue() as u16 + split.green() as u16, 100);
    }
    let (at, split) = changes.last().unwrap();
    assert_eq!(*at, Duration::from_secs(540));
    assert_eq!(*split, WeightSplit::all_green());
}

#[tokio::test(start_paused = true)]
async fn uneven_increment_is_clamped_at_full_weight() {
    let registry = registry().await;
    let cfg = ShiftConfig {
        increment_percent: 30,
        ..linear_ten_per_minute()
    };
    let (controller, _abort) = controller(&registry, Arc::new(ScriptedHealth::new(&[])), cfg);

    let record = controller.run().await;
    assert_eq!(record.phase, DeploymentPhase::Completed);

    let greens: Vec<u8> = registry
        .production_changes()
        .iter()
        .map(|(_, split)| split.green())
        .collect();
    assert_eq!(greens, vec![30, 60, 90, 100]);
}

#[tokio::test(start_paused = true)]
async fn broken_healthy_streak_keeps_validating() {
    use ProbeResult::*;

    let registry = registry().await;
    let cfg = ShiftConfig {
        healthy_threshold: 2,
        ..linear_ten_per_minute()
    };
    // Checks at t=0, 10, 20, 30.
    let health = Arc::new(ScriptedHealth::new(&[Healthy, Unhealthy, Healthy, Healthy]));
    let (controller, _abort) = controller(&registry, health, cfg);
    let status = controller.subscribe();
    let task = tokio::spawn(controller.run());

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(status.borrow().phase, DeploymentPhase::Validating);
    assert!(registry.production_changes().is_empty());

    let record = task.await.unwrap();
    assert_eq!(record.phase, DeploymentPhase::Completed);
    let (first_shift, split) = registry.production_changes()[0];
    assert_eq!(first_shift, Duration::from_secs(30));
    assert_eq!(split.green(), 10);
}
