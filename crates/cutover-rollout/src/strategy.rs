//! Deployment strategies — all at once, or blue/green with linear shifting.

use std::time::Duration;

use cutover_core::config::StrategyConfig;

use crate::error::{RolloutError, RolloutResult};

/// How a deployment group rolls out a new revision.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeploymentStrategy {
    /// Register the new revision and move all traffic in one step,
    /// without health gating. For environments without traffic shifting.
    Simple,
    /// Validate green, then shift traffic linearly while health holds.
    BlueGreen(ShiftConfig),
}

impl Default for DeploymentStrategy {
    fn default() -> Self {
        Self::BlueGreen(ShiftConfig::default())
    }
}

impl DeploymentStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            DeploymentStrategy::Simple => "simple",
            DeploymentStrategy::BlueGreen(_) => "blue_green",
        }
    }

    pub fn validate(&self) -> RolloutResult<()> {
        match self {
            DeploymentStrategy::Simple => Ok(()),
            DeploymentStrategy::BlueGreen(cfg) => cfg.validate(),
        }
    }
}

/// Linear traffic shift parameters, e.g. 10% every minute.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ShiftConfig {
    /// Percentage points moved to green per shift tick (1-100).
    pub increment_percent: u32,
    /// Seconds between shift ticks.
    pub interval_secs: u64,
    /// Seconds green has to become healthy before the deployment fails.
    pub validation_timeout_secs: u64,
    /// Seconds between health checks.
    pub health_check_interval_secs: u64,
    /// Consecutive healthy checks required to pass validation.
    pub healthy_threshold: u32,
    /// Consecutive non-healthy checks that trigger a rollback.
    pub unhealthy_threshold: u32,
    /// Consecutive held shift ticks tolerated; one more rolls back.
    pub max_stalled_ticks: u32,
}

impl Default for ShiftConfig {
    fn default() -> Self {
        Self {
            increment_percent: 10,
            interval_secs: 60,
            validation_timeout_secs: 300,
            health_check_interval_secs: 10,
            healthy_threshold: 2,
            unhealthy_threshold: 2,
            max_stalled_ticks: 5,
        }
    }
}

impl ShiftConfig {
    pub fn validate(&self) -> RolloutResult<()> {
        let invalid = |msg: String| Err(RolloutError::Configuration(msg));

        if !(1..=100).contains(&self.increment_percent) {
            return invalid(format!(
                "increment_percent must be within 1..=100, got {}",
                self.increment_percent
            ));
        }
        if self.interval_secs == 0 {
            return invalid("interval_secs must be greater than zero".to_string());
        }
        if self.validation_timeout_secs == 0 {
            return invalid("validation_timeout_secs must be greater than zero".to_string());
        }
        if self.health_check_interval_secs == 0 {
            return invalid("health_check_interval_secs must be greater than zero".to_string());
        }
        if self.healthy_threshold == 0 || self.unhealthy_threshold == 0 {
            return invalid("health thresholds must be at least 1".to_string());
        }
        if self.max_stalled_ticks == 0 {
            return invalid("max_stalled_ticks must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Shift ticks needed to go from 0 to 100.
    pub fn increments_to_full(&self) -> u32 {
        100u32.div_ceil(self.increment_percent.max(1))
    }
}

impl TryFrom<&StrategyConfig> for DeploymentStrategy {
    type Error = RolloutError;

    fn try_from(raw: &StrategyConfig) -> RolloutResult<Self> {
        let StrategyConfig::BlueGreen {
            increment_percent,
            interval_secs,
            validation_timeout_secs,
            health_check_interval_secs,
            healthy_threshold,
            unhealthy_threshold,
            max_stalled_ticks,
        } = raw
        else {
            return Ok(DeploymentStrategy::Simple);
        };

        let defaults = ShiftConfig::default();
        let config = ShiftConfig {
            increment_percent: non_negative(
                "increment_percent",
                *increment_percent,
                defaults.increment_percent,
            )?,
            interval_secs: non_negative("interval_secs", *interval_secs, defaults.interval_secs)?,
            validation_timeout_secs: non_negative(
                "validation_timeout_secs",
                *validation_timeout_secs,
                defaults.validation_timeout_secs,
            )?,
            health_check_interval_secs: non_negative(
                "health_check_interval_secs",
                *health_check_interval_secs,
                defaults.health_check_interval_secs,
            )?,
            healthy_threshold: non_negative(
                "healthy_threshold",
                *healthy_threshold,
                defaults.healthy_threshold,
            )?,
            unhealthy_threshold: non_negative(
                "unhealthy_threshold",
                *unhealthy_threshold,
                defaults.unhealthy_threshold,
            )?,
            max_stalled_ticks: non_negative(
                "max_stalled_ticks",
                *max_stalled_ticks,
                defaults.max_stalled_ticks,
            )?,
        };
        config.validate()?;
        Ok(DeploymentStrategy::BlueGreen(config))
    }
}

/// Convert a signed config value, falling back to `default` when absent.
fn non_negative<T: TryFrom<i64>>(field: &str, value: Option<i64>, default: T) -> RolloutResult<T> {
    match value {
        None => Ok(default),
        Some(v) => T::try_from(v).map_err(|_| {
            RolloutError::Configuration(format!("{field} is out of range: {v}"))
        }),
    }
}
