//! cutover rollouts — blue/green traffic shifting with health gates.
//!
//! This crate provides the deployment state machine that moves a
//! service's production traffic from its blue target group to its green
//! one, and the deployment group that owns one such deployment at a time.
//!
//! # Components
//!
//! - **`strategy`** — `Simple` (all at once) or `BlueGreen(ShiftConfig)`
//! - **`deployment`** — Phase transitions and the weight invariants
//! - **`controller`** — Async driver: validation, shift loop, rollback
//! - **`group`** — Single active deployment per group, archive, promotion

pub mod controller;
pub mod deployment;
pub mod error;
pub mod group;
pub mod strategy;

pub use controller::TrafficShiftController;
pub use deployment::Deployment;
pub use error::{RolloutError, RolloutResult};
pub use group::{DeploymentGroup, DeploymentHandle, Revision};
pub use strategy::{DeploymentStrategy, ShiftConfig};
