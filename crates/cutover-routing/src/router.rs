//! In-memory weighted router.
//!
//! Holds target groups and the listeners bound to them. A listener sends
//! `green` percent of requests to its green group and the rest to blue;
//! within a group, targets are picked round-robin. A group's `weight` is
//! the share of the production listener it carries; test listeners route
//! but leave it alone. All state sits behind one lock, so a weight change
//! and a health read never interleave.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use cutover_state::HealthStatus;

use crate::error::{RoutingError, RoutingResult};
use crate::registry::TargetRegistry;
use crate::target::{Color, ListenerRole, Target, TargetGroup};
use crate::weights::WeightSplit;

/// Internal state for a single group.
struct GroupEntry {
    group: TargetGroup,
    counter: AtomicUsize,
}

/// Internal state for a single listener.
struct ListenerEntry {
    role: ListenerRole,
    blue: String,
    green: String,
    split: WeightSplit,
    counter: AtomicUsize,
}

#[derive(Default)]
struct RouterState {
    groups: HashMap<String, GroupEntry>,
    listeners: HashMap<String, ListenerEntry>,
}

impl RouterState {
    fn group_mut(&mut self, id: &str) -> RoutingResult<&mut GroupEntry> {
        self.groups
            .get_mut(id)
            .ok_or_else(|| RoutingError::UnknownGroup(id.to_string()))
    }

    /// Copy a production listener's split onto the weight field of its groups.
    fn sync_group_weights(&mut self, listener: &str) {
        let Some(entry) = self.listeners.get(listener) else {
            return;
        };
        if entry.role != ListenerRole::Production {
            return;
        }
        let (blue, green, split) = (entry.blue.clone(), entry.green.clone(), entry.split);
        if let Some(g) = self.groups.get_mut(&blue) {
            g.group.weight = split.blue();
        }
        if let Some(g) = self.groups.get_mut(&green) {
            g.group.weight = split.green();
        }
    }
}

/// Routes listener traffic across blue/green target groups.
#[derive(Clone, Default)]
pub struct WeightedRouter {
    state: Arc<RwLock<RouterState>>,
}

impl WeightedRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty target group. Recreating an existing id resets it.
    pub async fn create_group(&self, id: &str, protocol: &str, port: u16) {
        let mut state = self.state.write().await;
        state.groups.insert(
            id.to_string(),
            GroupEntry {
                group: TargetGroup::new(id, protocol, port),
                counter: AtomicUsize::new(0),
            },
        );
        debug!(group = id, protocol, port, "target group created");
    }

    /// Pick the next target for a request arriving on `listener`.
    ///
    /// Color selection is deterministic: out of every 100 consecutive
    /// requests, exactly `green` go to the green group.
    pub async fn route(&self, listener: &str) -> Option<(Color, Target)> {
        let state = self.state.read().await;
        let entry = state.listeners.get(listener)?;

        let slot = entry.counter.fetch_add(1, Ordering::Relaxed) % 100;
        let (color, group_id) = if slot < entry.split.green() as usize {
            (Color::Green, &entry.green)
        } else {
            (Color::Blue, &entry.blue)
        };

        let group = state.groups.get(group_id)?;
        if group.group.targets.is_empty() {
            return None;
        }
        let idx = group.counter.fetch_add(1, Ordering::Relaxed) % group.group.targets.len();
        Some((color, group.group.targets[idx].clone()))
    }

    pub async fn list_groups(&self) -> Vec<TargetGroup> {
        let state = self.state.read().await;
        state.groups.values().map(|g| g.group.clone()).collect()
    }

    pub async fn list_listeners(&self) -> Vec<String> {
        let state = self.state.read().await;
        state.listeners.keys().cloned().collect()
    }
}

#[async_trait]
impl TargetRegistry for WeightedRouter {
    async fn register_targets(&self, group: &str, targets: &[Target]) -> RoutingResult<()> {
        let mut state = self.state.write().await;
        let entry = state.group_mut(group)?;
        for target in targets {
            if !entry.group.targets.contains(target) {
                entry.group.targets.push(target.clone());
            }
        }
        debug!(
            group,
            count = entry.group.targets.len(),
            "registered targets"
        );
        Ok(())
    }

    async fn deregister_all(&self, group: &str) -> RoutingResult<Vec<Target>> {
        let mut state = self.state.write().await;
        let entry = state.group_mut(group)?;
        let removed = std::mem::take(&mut entry.group.targets);
        entry.group.health = HealthStatus::Unknown;
        debug!(group, count = removed.len(), "deregistered targets");
        Ok(removed)
    }

    async fn targets(&self, group: &str) -> RoutingResult<Vec<Target>> {
        Ok(self.group(group).await?.targets)
    }

    async fn group(&self, group: &str) -> RoutingResult<TargetGroup> {
        let state = self.state.read().await;
        state
            .groups
            .get(group)
            .map(|g| g.group.clone())
            .ok_or_else(|| RoutingError::UnknownGroup(group.to_string()))
    }

    async fn bind_listener(
        &self,
        listener: &str,
        role: ListenerRole,
        blue: &str,
        green: &str,
        split: WeightSplit,
    ) -> RoutingResult<()> {
        let mut state = self.state.write().await;
        for id in [blue, green] {
            if !state.groups.contains_key(id) {
                return Err(RoutingError::UnknownGroup(id.to_string()));
            }
        }
        state.listeners.insert(
            listener.to_string(),
            ListenerEntry {
                role,
                blue: blue.to_string(),
                green: green.to_string(),
                split,
                counter: AtomicUsize::new(0),
            },
        );
        state.sync_group_weights(listener);
        debug!(
            listener,
            role = ?role,
            blue,
            green,
            blue_weight = split.blue(),
            green_weight = split.green(),
            "listener bound"
        );
        Ok(())
    }

    async fn set_weights(&self, listener: &str, split: WeightSplit) -> RoutingResult<()> {
        let mut state = self.state.write().await;
        let entry = state
            .listeners
            .get_mut(listener)
            .ok_or_else(|| RoutingError::UnknownListener(listener.to_string()))?;
        entry.split = split;
        state.sync_group_weights(listener);
        debug!(
            listener,
            blue_weight = split.blue(),
            green_weight = split.green(),
            "weights updated"
        );
        Ok(())
    }

    async fn weights(&self, listener: &str) -> RoutingResult<WeightSplit> {
        let state = self.state.read().await;
        state
            .listeners
            .get(listener)
            .map(|l| l.split)
            .ok_or_else(|| RoutingError::UnknownListener(listener.to_string()))
    }

    async fn record_health(&self, group: &str, health: HealthStatus) -> RoutingResult<()> {
        let mut state = self.state.write().await;
        state.group_mut(group)?.group.health = health;
        Ok(())
    }
}
