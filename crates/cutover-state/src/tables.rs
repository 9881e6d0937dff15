//! redb table definitions for the cutover state store.

use redb::TableDefinition;

/// Pipeline runs keyed by run id.
pub const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Archived deployments keyed by `{group}:{attempt:010}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Artifact metadata keyed by `{run_id}:{name}:{version:06}`.
pub const ARTIFACTS: TableDefinition<&str, &[u8]> = TableDefinition::new("artifacts");
