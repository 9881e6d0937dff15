//! One deployment attempt and its phase transitions.
//!
//! `Deployment` holds no I/O. It only permits the transitions of the
//! shift state machine and keeps the weight invariants: blue plus green
//! is always 100, and green only goes down through a rollback.
//!
//! ```text
//! Initializing → Validating → Shifting → Finalizing → Completed
//!      │             │           │
//!      └─────────────┴───────────┴──→ RollingBack → RolledBack
//!                    │                     │
//!                    └─────────────────────┴──→ Failed
//! ```

use tracing::{info, warn};

use cutover_core::epoch_secs;
use cutover_routing::WeightSplit;
use cutover_state::{DeploymentPhase, DeploymentRecord, FailureCause};

use crate::error::{RolloutError, RolloutResult};

#[derive(Debug, Clone)]
pub struct Deployment {
    group: String,
    service: String,
    attempt: u64,
    revision: String,
    strategy: String,
    phase: DeploymentPhase,
    split: WeightSplit,
    started_at: u64,
    last_transition_at: u64,
    failure: Option<FailureCause>,
}

impl Deployment {
    pub fn new(group: &str, service: &str, attempt: u64, revision: &str, strategy: &str) -> Self {
        let now = epoch_secs();
        Self {
            group: group.to_string(),
            service: service.to_string(),
            attempt,
            revision: revision.to_string(),
            strategy: strategy.to_string(),
            phase: DeploymentPhase::Initializing,
            split: WeightSplit::all_blue(),
            started_at: now,
            last_transition_at: now,
            failure: None,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn phase(&self) -> DeploymentPhase {
        self.phase
    }

    pub fn split(&self) -> WeightSplit {
        self.split
    }

    pub fn failure(&self) -> Option<&FailureCause> {
        self.failure.as_ref()
    }

    /// Snapshot suitable for status queries and the archive.
    pub fn record(&self) -> DeploymentRecord {
        DeploymentRecord {
            group: self.group.clone(),
            service: self.service.clone(),
            attempt: self.attempt,
            revision: self.revision.clone(),
            strategy: self.strategy.clone(),
            phase: self.phase,
            blue_weight: self.split.blue(),
            green_weight: self.split.green(),
            started_at: self.started_at,
            last_transition_at: self.last_transition_at,
            failure: self.failure.clone(),
        }
    }

    fn transition(&mut self, allowed_from: &[DeploymentPhase], to: DeploymentPhase) -> RolloutResult<()> {
        if !allowed_from.contains(&self.phase) {
            return Err(RolloutError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        info!(
            group = %self.group,
            attempt = self.attempt,
            from = %self.phase,
            to = %to,
            green_weight = self.split.green(),
            "deployment phase change"
        );
        self.phase = to;
        self.last_transition_at = epoch_secs();
        Ok(())
    }

    /// Green targets registered; start waiting for them to turn healthy.
    pub fn begin_validation(&mut self) -> RolloutResult<()> {
        self.transition(&[DeploymentPhase::Initializing], DeploymentPhase::Validating)
    }

    /// Green passed validation; traffic migration starts from 0.
    pub fn begin_shifting(&mut self) -> RolloutResult<()> {
        self.transition(&[DeploymentPhase::Validating], DeploymentPhase::Shifting)?;
        self.split = WeightSplit::all_blue();
        Ok(())
    }

    /// Move `step` points to green, clamped at 100. Only valid while shifting.
    pub fn shift(&mut self, step: u32) -> RolloutResult<WeightSplit> {
        if self.phase != DeploymentPhase::Shifting {
            return Err(RolloutError::InvalidTransition {
                from: self.phase,
                to: DeploymentPhase::Shifting,
            });
        }
        self.split = self.split.shifted(step);
        Ok(self.split)
    }

    /// Green carries all traffic; clean-up of blue follows.
    pub fn begin_finalizing(&mut self) -> RolloutResult<()> {
        if self.split.green() != 100 {
            return Err(RolloutError::InvalidTransition {
                from: self.phase,
                to: DeploymentPhase::Finalizing,
            });
        }
        self.transition(&[DeploymentPhase::Shifting], DeploymentPhase::Finalizing)
    }

    /// All-at-once cutover: straight from `Initializing` to `Finalizing`
    /// with green at 100.
    pub fn cut_over(&mut self) -> RolloutResult<WeightSplit> {
        self.transition(&[DeploymentPhase::Initializing], DeploymentPhase::Finalizing)?;
        self.split = WeightSplit::all_green();
        Ok(self.split)
    }

    pub fn complete(&mut self) -> RolloutResult<()> {
        self.transition(&[DeploymentPhase::Finalizing], DeploymentPhase::Completed)
    }

    /// Start rolling back. The first recorded cause wins.
    pub fn begin_rollback(&mut self, cause: FailureCause) -> RolloutResult<()> {
        self.transition(
            &[
                DeploymentPhase::Initializing,
                DeploymentPhase::Validating,
                DeploymentPhase::Shifting,
            ],
            DeploymentPhase::RollingBack,
        )?;
        warn!(
            group = %self.group,
            attempt = self.attempt,
            %cause,
            green_weight = self.split.green(),
            "rolling back"
        );
        self.failure.get_or_insert(cause);
        Ok(())
    }

    /// Blue is back at 100.
    pub fn rolled_back(&mut self) -> RolloutResult<()> {
        self.transition(&[DeploymentPhase::RollingBack], DeploymentPhase::RolledBack)?;
        self.split = WeightSplit::all_blue();
        Ok(())
    }

    /// Terminal failure. `split` is what the listener actually carries.
    pub fn fail(&mut self, cause: FailureCause, split: WeightSplit) -> RolloutResult<()> {
        self.transition(
            &[
                DeploymentPhase::Initializing,
                DeploymentPhase::Validating,
                DeploymentPhase::RollingBack,
            ],
            DeploymentPhase::Failed,
        )?;
        self.split = split;
        self.failure = Some(cause);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> Deployment {
        Deployment::new("prod", "api", 1, "sha256:feed", "blue_green")
    }

    #[test]
    fn happy_path_ends_all_green() {
        let mut d = deployment();
        d.begin_validation().unwrap();
        d.begin_shifting().unwrap();
        for _ in 0..10 {
            let split = d.shift(10).unwrap();
            assert_eq!(split.blue() as u16 + split.green() as u16, 100);
        }
        d.begin_finalizing().unwrap();
        d.complete().unwrap();

        let record = d.record();
        assert_eq!(record.phase, DeploymentPhase::Completed);
        assert_eq!(record.green_weight, 100);
        assert_eq!(record.blue_weight, 0);
        assert!(record.failure.is_none());
    }

    #[test]
    fn green_weight_never_decreases_while_shifting() {
        let mut d = deployment();
        d.begin_validation().unwrap();
        d.begin_shifting().unwrap();
        let mut last = 0;
        for _ in 0..15 {
            let green = d.shift(7).unwrap().green();
            assert!(green >= last);
            last = green;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn cannot_finalize_below_full_weight() {
        let mut d = deployment();
        d.begin_validation().unwrap();
        d.begin_shifting().unwrap();
        d.shift(50).unwrap();
        assert!(matches!(
            d.begin_finalizing(),
            Err(RolloutError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn rollback_restores_blue_and_keeps_cause() {
        let mut d = deployment();
        d.begin_validation().unwrap();
        d.begin_shifting().unwrap();
        d.shift(30).unwrap();
        d.begin_rollback(FailureCause::HealthRegression).unwrap();
        assert_eq!(d.split().green(), 30);

        d.rolled_back().unwrap();
        assert_eq!(d.phase(), DeploymentPhase::RolledBack);
        assert_eq!(d.split(), WeightSplit::all_blue());
        assert_eq!(d.failure(), Some(&FailureCause::HealthRegression));
    }

    #[test]
    fn shift_outside_shifting_is_rejected() {
        let mut d = deployment();
        assert!(d.shift(10).is_err());
        d.begin_validation().unwrap();
        assert!(d.shift(10).is_err());
    }

    #[test]
    fn terminal_phases_reject_rollback() {
        let mut d = deployment();
        d.begin_validation().unwrap();
        d.begin_rollback(FailureCause::Aborted {
            reason: "operator".to_string(),
        })
        .unwrap();
        d.rolled_back().unwrap();
        assert!(d
            .begin_rollback(FailureCause::HealthRegression)
            .is_err());
        assert_eq!(
            d.failure(),
            Some(&FailureCause::Aborted {
                reason: "operator".to_string()
            })
        );
    }

    #[test]
    fn cut_over_goes_straight_to_finalizing() {
        let mut d = Deployment::new("test", "api", 1, "img", "simple");
        let split = d.cut_over().unwrap();
        assert_eq!(split, WeightSplit::all_green());
        d.complete().unwrap();
        assert_eq!(d.phase(), DeploymentPhase::Completed);
    }

    #[test]
    fn validation_timeout_fails_with_blue_intact() {
        let mut d = deployment();
        d.begin_validation().unwrap();
        d.fail(FailureCause::ValidationTimeout, WeightSplit::all_blue())
            .unwrap();
        assert_eq!(d.phase(), DeploymentPhase::Failed);
        assert!(d.phase().is_terminal());
        assert_eq!(d.record().green_weight, 0);
    }
}
