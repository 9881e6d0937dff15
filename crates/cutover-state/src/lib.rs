//! cutover-state — embedded state store for cutover.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for pipeline runs, archived deployments, and artifact metadata.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{group}:{attempt}`, `{run_id}:{name}:{version}`) are
//! zero-padded so prefix scans come back in numeric order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
