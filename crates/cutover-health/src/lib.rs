//! cutover-health — health signals for target groups.
//!
//! Health is consumed, not produced: a `HealthSource` reports per-target
//! probe results, this crate folds them into a group status and tracks
//! consecutive results against the configured thresholds.
//!
//! # Architecture
//!
//! ```text
//! HealthSource::probe(group, targets) → [ProbeResult]
//!   └── aggregate() → HealthStatus (Healthy | Degraded | Unhealthy)
//!         └── HealthTracker (consecutive healthy / unhealthy streaks)
//! ```
//!
//! A probe that cannot be evaluated counts as unhealthy. Nothing in this
//! crate ever reports a group healthy on missing data.

pub mod checker;
pub mod error;
pub mod probe;
pub mod source;

pub use checker::{HealthTracker, ProbeResult, aggregate};
pub use error::{HealthError, HealthResult};
pub use probe::HttpHealthSource;
pub use source::{HealthSource, MemoryHealthSource, check_group};
