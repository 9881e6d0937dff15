//! cutover-routing — where traffic for a service goes.
//!
//! A service has two target groups (blue and green) behind a production
//! listener and an optional test listener. This crate models them and the
//! capability that mutates them.
//!
//! # Components
//!
//! - **`target`** — Targets, target groups, and the blue/green pair
//! - **`weights`** — The blue/green weight split (always sums to 100)
//! - **`registry`** — `TargetRegistry` trait for the load-balancing layer
//! - **`router`** — In-memory `TargetRegistry` with weighted backend selection

pub mod error;
pub mod registry;
pub mod router;
pub mod target;
pub mod weights;

pub use error::{RoutingError, RoutingResult};
pub use registry::TargetRegistry;
pub use router::WeightedRouter;
pub use target::{Color, ListenerRole, Target, TargetGroup, TargetGroupPair};
pub use weights::WeightSplit;
