//! The load-balancing capability the rollout controller drives.

use async_trait::async_trait;

use cutover_state::HealthStatus;

use crate::error::RoutingResult;
use crate::target::{ListenerRole, Target, TargetGroup};
use crate::weights::WeightSplit;

/// Registers targets and sets listener weights.
///
/// Implementations must apply `set_weights` atomically: a concurrent
/// reader observes either the old split or the new one.
#[async_trait]
pub trait TargetRegistry: Send + Sync {
    /// Add targets to a group. Already registered targets are kept once.
    async fn register_targets(&self, group: &str, targets: &[Target]) -> RoutingResult<()>;

    /// Remove every target from a group, returning what was removed.
    async fn deregister_all(&self, group: &str) -> RoutingResult<Vec<Target>>;

    /// Targets currently registered in a group.
    async fn targets(&self, group: &str) -> RoutingResult<Vec<Target>>;

    /// Snapshot of a group, including its production weight and latest health.
    async fn group(&self, group: &str) -> RoutingResult<TargetGroup>;

    /// Point a listener at a blue and a green group with the given split.
    async fn bind_listener(
        &self,
        listener: &str,
        role: ListenerRole,
        blue: &str,
        green: &str,
        split: WeightSplit,
    ) -> RoutingResult<()>;

    /// Change the split of a bound listener.
    async fn set_weights(&self, listener: &str, split: WeightSplit) -> RoutingResult<()>;

    async fn weights(&self, listener: &str) -> RoutingResult<WeightSplit>;

    /// Record the latest aggregated health of a group.
    async fn record_health(&self, group: &str, health: HealthStatus) -> RoutingResult<()>;
}
