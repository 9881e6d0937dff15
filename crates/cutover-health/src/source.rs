//! The injected health signal.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use cutover_routing::Target;
use cutover_state::HealthStatus;

use crate::checker::{ProbeResult, aggregate};
use crate::error::{HealthError, HealthResult};

/// Reports per-target health for a target group.
#[async_trait]
pub trait HealthSource: Send + Sync {
    /// Probe every target of `group`. One result per target, any order.
    async fn probe(&self, group: &str, targets: &[Target]) -> HealthResult<Vec<ProbeResult>>;
}

/// Probe a group and aggregate, failing closed.
///
/// A source error is logged and reported as `Unhealthy`.
pub async fn check_group(
    source: &dyn HealthSource,
    group: &str,
    targets: &[Target],
) -> HealthStatus {
    match source.probe(group, targets).await {
        Ok(results) => aggregate(&results),
        Err(e) => {
            warn!(group, error = %e, "health check failed, treating group as unhealthy");
            HealthStatus::Unhealthy
        }
    }
}

/// Health set from outside: by tests, or by an agent pushing results.
///
/// Per-target results override the group default. A group marked
/// unavailable makes `probe` return an error.
#[derive(Clone, Default)]
pub struct MemoryHealthSource {
    inner: Arc<RwLock<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    group_default: HashMap<String, ProbeResult>,
    targets: HashMap<String, ProbeResult>,
    unavailable: HashMap<String, String>,
}

impl MemoryHealthSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Result reported for every target of `group` without an override.
    pub async fn set_group(&self, group: &str, result: ProbeResult) {
        let mut inner = self.inner.write().await;
        inner.group_default.insert(group.to_string(), result);
    }

    pub async fn set_target(&self, target_id: &str, result: ProbeResult) {
        let mut inner = self.inner.write().await;
        inner.targets.insert(target_id.to_string(), result);
    }

    /// Make probes of `group` error out until `clear_unavailable`.
    pub async fn set_unavailable(&self, group: &str, reason: &str) {
        let mut inner = self.inner.write().await;
        inner.unavailable.insert(group.to_string(), reason.to_string());
    }

    pub async fn clear_unavailable(&self, group: &str) {
        let mut inner = self.inner.write().await;
        inner.unavailable.remove(group);
    }
}

#[async_trait]
impl HealthSource for MemoryHealthSource {
    async fn probe(&self, group: &str, targets: &[Target]) -> HealthResult<Vec<ProbeResult>> {
        let inner = self.inner.read().await;
        if let Some(reason) = inner.unavailable.get(group) {
            return Err(HealthError::Unavailable(reason.clone()));
        }
        let default = inner
            .group_default
            .get(group)
            .copied()
            .unwrap_or(ProbeResult::Failed);
        Ok(targets
            .iter()
            .map(|t| inner.targets.get(&t.id).copied().unwrap_or(default))
            .collect())
    }
}
