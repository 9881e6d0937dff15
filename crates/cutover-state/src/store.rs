//! StateStore — redb-backed state persistence for cutover.
//!
//! Provides typed operations over pipeline runs, archived deployments, and
//! artifact metadata. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(RUNS).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(ARTIFACTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Scan a table, keeping values whose key starts with `prefix`.
    fn scan<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let record: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok(results)
    }

    // ── Runs ───────────────────────────────────────────────────────

    /// Insert or update a pipeline run.
    pub fn put_run(&self, run: &PipelineRunRecord) -> StateResult<()> {
        self.put(RUNS, &run.id, run)?;
        debug!(run_id = %run.id, status = ?run.status, "run stored");
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> StateResult<Option<PipelineRunRecord>> {
        self.get(RUNS, run_id)
    }

    /// List all runs, newest first.
    pub fn list_runs(&self) -> StateResult<Vec<PipelineRunRecord>> {
        let mut runs: Vec<PipelineRunRecord> = self.scan(RUNS, "")?;
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(runs)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Archive a deployment record. Re-archiving the same attempt overwrites it.
    pub fn archive_deployment(&self, record: &DeploymentRecord) -> StateResult<()> {
        let key = record.table_key();
        self.put(DEPLOYMENTS, &key, record)?;
        debug!(%key, phase = %record.phase, "deployment archived");
        Ok(())
    }

    pub fn get_deployment(&self, group: &str, attempt: u64) -> StateResult<Option<DeploymentRecord>> {
        self.get(DEPLOYMENTS, &deployment_key(group, attempt))
    }

    /// All archived attempts for a group, oldest first.
    pub fn list_deployments_for_group(&self, group: &str) -> StateResult<Vec<DeploymentRecord>> {
        self.scan(DEPLOYMENTS, &format!("{group}:"))
    }

    /// Attempt id for the next deployment of `group`.
    pub fn next_attempt(&self, group: &str) -> StateResult<u64> {
        let last = self
            .list_deployments_for_group(group)?
            .last()
            .map(|r| r.attempt)
            .unwrap_or(0);
        Ok(last + 1)
    }

    // ── Artifacts ──────────────────────────────────────────────────

    pub fn put_artifact(&self, record: &ArtifactRecord) -> StateResult<()> {
        self.put(ARTIFACTS, &record.table_key(), record)
    }

    /// All artifact versions committed during a run.
    pub fn list_artifacts_for_run(&self, run_id: &str) -> StateResult<Vec<ArtifactRecord>> {
        self.scan(ARTIFACTS, &format!("{run_id}:"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutover_core::PayloadRef;

    fn test_run(id: &str, started_at: u64) -> PipelineRunRecord {
        PipelineRunRecord {
            id: id.to_string(),
            pipeline: "workshop".to_string(),
            branch: "main".to_string(),
            commit: "abc123".to_string(),
            status: RunStatus::Running,
            stages: vec![StageRecord {
                name: "Source".to_string(),
                status: StageStatus::Pending,
            }],
            failure: None,
            started_at,
            finished_at: None,
        }
    }

    fn test_deployment(group: &str, attempt: u64, phase: DeploymentPhase) -> DeploymentRecord {
        DeploymentRecord {
            group: group.to_string(),
            service: "app".to_string(),
            attempt,
            revision: "sha256:feed".to_string(),
            strategy: "blue_green".to_string(),
            phase,
            blue_weight: 0,
            green_weight: 100,
            started_at: 1000,
            last_transition_at: 1600,
            failure: None,
        }
    }

    // ── Runs ───────────────────────────────────────────────────────

    #[test]
    fn run_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run("run-1", 1000);

        store.put_run(&run).unwrap();
        assert_eq!(store.get_run("run-1").unwrap(), Some(run));
        assert!(store.get_run("run-2").unwrap().is_none());
    }

    #[test]
    fn run_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut run = test_run("run-1", 1000);
        store.put_run(&run).unwrap();

        run.status = RunStatus::Failed;
        run.failure = Some(RunFailure {
            stage: "Test".to_string(),
            action: "Unit".to_string(),
            cause: "exit status 1".to_string(),
        });
        store.put_run(&run).unwrap();

        let back = store.get_run("run-1").unwrap().unwrap();
        assert_eq!(back.status, RunStatus::Failed);
        assert_eq!(back.failure.unwrap().stage, "Test");
    }

    #[test]
    fn list_runs_newest_first() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_run(&test_run("a", 1000)).unwrap();
        store.put_run(&test_run("b", 3000)).unwrap();
        store.put_run(&test_run("c", 2000)).unwrap();

        let ids: Vec<String> = store.list_runs().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    // ── Deployments ────────────────────────────────────────────────

    #[test]
    fn next_attempt_is_monotonic_per_group() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.next_attempt("prod").unwrap(), 1);

        store
            .archive_deployment(&test_deployment("prod", 1, DeploymentPhase::RolledBack))
            .unwrap();
        store
            .archive_deployment(&test_deployment("prod", 2, DeploymentPhase::Completed))
            .unwrap();
        store
            .archive_deployment(&test_deployment("prod-eu", 7, DeploymentPhase::Completed))
            .unwrap();

        assert_eq!(store.next_attempt("prod").unwrap(), 3);
        assert_eq!(store.next_attempt("prod-eu").unwrap(), 8);
        assert_eq!(store.list_deployments_for_group("prod").unwrap().len(), 2);
    }

    #[test]
    fn attempts_sort_numerically() {
        let store = StateStore::open_in_memory().unwrap();
        for attempt in [10, 9, 2] {
            store
                .archive_deployment(&test_deployment("prod", attempt, DeploymentPhase::Completed))
                .unwrap();
        }
        let attempts: Vec<u64> = store
            .list_deployments_for_group("prod")
            .unwrap()
            .iter()
            .map(|r| r.attempt)
            .collect();
        assert_eq!(attempts, vec![2, 9, 10]);
    }

    #[test]
    fn failure_cause_survives_archive() {
        let store = StateStore::open_in_memory().unwrap();
        let mut record = test_deployment("prod", 1, DeploymentPhase::Failed);
        record.blue_weight = 100;
        record.green_weight = 0;
        record.failure = Some(FailureCause::RollbackIncomplete {
            detail: "blue has no targets".to_string(),
        });
        store.archive_deployment(&record).unwrap();

        let back = store.get_deployment("prod", 1).unwrap().unwrap();
        assert_eq!(back, record);
        assert_eq!(back.blue_weight, 100);
    }

    // ── Artifacts ──────────────────────────────────────────────────

    #[test]
    fn artifacts_listed_per_run() {
        let store = StateStore::open_in_memory().unwrap();
        for (run, version) in [("run-1", 1), ("run-1", 2), ("run-2", 1)] {
            store
                .put_artifact(&ArtifactRecord {
                    run_id: run.to_string(),
                    name: "image".to_string(),
                    version,
                    producer_stage: "Image".to_string(),
                    payload: PayloadRef::for_bytes("mem://", format!("{run}{version}").as_bytes()),
                    created_at: 1000,
                })
                .unwrap();
        }
        let run1 = store.list_artifacts_for_run("run-1").unwrap();
        assert_eq!(run1.len(), 2);
        assert_eq!(run1[1].version, 2);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store
                .archive_deployment(&test_deployment("prod", 4, DeploymentPhase::Completed))
                .unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.next_attempt("prod").unwrap(), 5);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_runs().unwrap().is_empty());
        assert!(store.list_deployments_for_group("any").unwrap().is_empty());
        assert!(store.list_artifacts_for_run("any").unwrap().is_empty());
    }
}
