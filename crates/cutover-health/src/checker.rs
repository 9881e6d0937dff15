//! Probe results, group aggregation, and threshold tracking.

use tracing::{debug, warn};

use cutover_state::HealthStatus;

/// Result of a single probe against one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The target answered its health check successfully.
    Healthy,
    /// The target answered, but not successfully.
    Unhealthy,
    /// The probe could not be executed (connection error, timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeResult::Healthy)
    }
}

/// Fold per-target results into a group status.
///
/// All healthy is `Healthy`, none healthy (or no targets at all) is
/// `Unhealthy`, anything in between is `Degraded`.
pub fn aggregate(results: &[ProbeResult]) -> HealthStatus {
    let healthy = results.iter().filter(|r| r.is_healthy()).count();
    if results.is_empty() || healthy == 0 {
        HealthStatus::Unhealthy
    } else if healthy == results.len() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

/// Tracks consecutive group checks against healthy/unhealthy thresholds.
///
/// Only `Healthy` observations count toward the healthy streak;
/// `Degraded`, `Unhealthy` and `Unknown` all count toward the unhealthy
/// streak. Each observation resets the opposite streak.
#[derive(Debug)]
pub struct HealthTracker {
    /// Status once a threshold has been crossed.
    status: HealthStatus,
    /// Most recent observation.
    last: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Consecutive healthy checks needed to report `Healthy`.
    healthy_threshold: u32,
    /// Consecutive non-healthy checks needed to report `Unhealthy`.
    unhealthy_threshold: u32,
}

impl HealthTracker {
    /// Start a tracker in `Unknown`. Thresholds below 1 are raised to 1.
    pub fn new(healthy_threshold: u32, unhealthy_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            last: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            healthy_threshold: healthy_threshold.max(1),
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    /// Record a group observation and return the thresholded status.
    pub fn record(&mut self, observed: HealthStatus) -> HealthStatus {
        self.last = observed;
        if observed == HealthStatus::Healthy {
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;

            if self.consecutive_successes >= self.healthy_threshold {
                if self.status != HealthStatus::Healthy {
                    debug!(
                        successes = self.consecutive_successes,
                        "group reached healthy threshold"
                    );
                }
                self.status = HealthStatus::Healthy;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;

            if self.consecutive_failures >= self.unhealthy_threshold {
                if self.status != HealthStatus::Unhealthy {
                    warn!(
                        failures = self.consecutive_failures,
                        threshold = self.unhealthy_threshold,
                        observed = ?observed,
                        "group crossed unhealthy threshold"
                    );
                }
                self.status = HealthStatus::Unhealthy;
            }
        }

        self.status
    }

    /// Thresholded status.
    pub fn status(&self) -> HealthStatus {
        self.status
    }

    /// Most recent raw observation.
    pub fn last(&self) -> HealthStatus {
        self.last
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// Forget streaks and go back to `Unknown`.
    pub fn reset(&mut self) {
        self.status = HealthStatus::Unknown;
        self.last = HealthStatus::Unknown;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
    }
}
