//! cutover-core — shared types and `cutover.toml` configuration.
//!
//! Everything here is free of I/O beyond reading the config file, so
//! every other crate in the workspace can depend on it.

pub mod config;
pub mod types;

pub use config::{ConfigError, CutoverConfig};
pub use types::*;
