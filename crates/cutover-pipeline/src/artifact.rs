//! Artifact store.
//!
//! Artifacts are named, versioned outputs of a stage, scoped to one run.
//! Payload bytes live in an [`ArtifactBlobStore`]; the store itself only
//! keeps immutable [`ArtifactHandle`]s and swaps the current handle of a
//! name once a new version's payload is fully written. Readers therefore
//! see the old version or the new one, never a partial payload.
//!
//! Writers to the same name are serialized; readers never wait on them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cutover_core::{PayloadRef, RunId, epoch_secs};
use cutover_state::{ArtifactRecord, StateStore};

use crate::error::{PipelineError, PipelineResult};

/// Where artifact payload bytes are kept.
#[async_trait]
pub trait ArtifactBlobStore: Send + Sync {
    /// Store `bytes` and return a reference to them. Must not return
    /// before the payload is durable and complete.
    async fn put(&self, bytes: &[u8]) -> PipelineResult<PayloadRef>;

    /// Load and verify a payload.
    async fn get(&self, payload: &PayloadRef) -> PipelineResult<Vec<u8>>;
}

/// Blob store for tests and single-process runs.
#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Arc<Vec<u8>>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactBlobStore for InMemoryBlobStore {
    async fn put(&self, bytes: &[u8]) -> PipelineResult<PayloadRef> {
        let payload = PayloadRef::for_bytes("mem://blobs", bytes);
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| PipelineError::ActionFailed("blob store lock poisoned".to_string()))?;
        blobs
            .entry(payload.location.clone())
            .or_insert_with(|| Arc::new(bytes.to_vec()));
        Ok(payload)
    }

    async fn get(&self, payload: &PayloadRef) -> PipelineResult<Vec<u8>> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| PipelineError::ActionFailed("blob store lock poisoned".to_string()))?;
        let bytes = blobs
            .get(&payload.location)
            .ok_or_else(|| PipelineError::CorruptArtifact {
                location: payload.location.clone(),
            })?;
        if !payload.verify(bytes) {
            return Err(PipelineError::CorruptArtifact {
                location: payload.location.clone(),
            });
        }
        Ok(Vec::clone(bytes))
    }
}

/// Content-addressed blobs in a directory, one file per digest.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn open(root: &Path) -> PipelineResult<Self> {
        tokio::fs::create_dir_all(root).await?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactBlobStore for FsBlobStore {
    async fn put(&self, bytes: &[u8]) -> PipelineResult<PayloadRef> {
        let payload = PayloadRef::for_bytes(&self.root.to_string_lossy(), bytes);
        let path = PathBuf::from(&payload.location);
        if tokio::fs::try_exists(&path).await? {
            return Ok(payload);
        }
        // Write aside and rename so a reader never sees a partial file.
        let staging = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, &path).await?;
        debug!(location = %payload.location, size = payload.size, "blob written");
        Ok(payload)
    }

    async fn get(&self, payload: &PayloadRef) -> PipelineResult<Vec<u8>> {
        let bytes = tokio::fs::read(&payload.location).await?;
        if !payload.verify(&bytes) {
            warn!(location = %payload.location, "blob digest mismatch");
            return Err(PipelineError::CorruptArtifact {
                location: payload.location.clone(),
            });
        }
        Ok(bytes)
    }
}

/// One immutable version of a named artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactHandle {
    pub run_id: RunId,
    pub name: String,
    pub version: u32,
    pub producer_stage: String,
    pub payload: PayloadRef,
    pub created_at: u64,
}

impl ArtifactHandle {
    pub fn record(&self) -> ArtifactRecord {
        ArtifactRecord {
            run_id: self.run_id.clone(),
            name: self.name.clone(),
            version: self.version,
            producer_stage: self.producer_stage.clone(),
            payload: self.payload.clone(),
            created_at: self.created_at,
        }
    }
}

type ArtifactKey = (RunId, String);

/// Named, versioned artifacts of pipeline runs.
#[derive(Clone)]
pub struct ArtifactStore {
    blobs: Arc<dyn ArtifactBlobStore>,
    current: Arc<RwLock<HashMap<ArtifactKey, Arc<ArtifactHandle>>>>,
    writers: Arc<Mutex<HashMap<ArtifactKey, Arc<Mutex<()>>>>>,
    state: Option<StateStore>,
}

impl ArtifactStore {
    pub fn new(blobs: Arc<dyn ArtifactBlobStore>) -> Self {
        Self {
            blobs,
            current: Arc::default(),
            writers: Arc::default(),
            state: None,
        }
    }

    /// Also record artifact metadata in the state store.
    pub fn with_state(mut self, state: StateStore) -> Self {
        self.state = Some(state);
        self
    }

    /// Store a new version of `name` for `run_id` and make it current.
    pub async fn put(
        &self,
        run_id: &str,
        name: &str,
        producer_stage: &str,
        payload: &[u8],
    ) -> PipelineResult<Arc<ArtifactHandle>> {
        let key = (run_id.to_string(), name.to_string());
        let writer = {
            let mut writers = self.writers.lock().await;
            writers.entry(key.clone()).or_default().clone()
        };
        let _guard = writer.lock().await;

        let version = self.lookup(&key)?.map(|h| h.version + 1).unwrap_or(1);
        let payload = self.blobs.put(payload).await?;
        let handle = Arc::new(ArtifactHandle {
            run_id: run_id.to_string(),
            name: name.to_string(),
            version,
            producer_stage: producer_stage.to_string(),
            payload,
            created_at: epoch_secs(),
        });

        if let Some(state) = &self.state {
            state.put_artifact(&handle.record())?;
        }
        self.current
            .write()
            .map_err(|_| poisoned())?
            .insert(key, handle.clone());

        info!(
            run_id,
            artifact = name,
            version,
            stage = producer_stage,
            digest = %handle.payload.digest,
            "artifact committed"
        );
        Ok(handle)
    }

    /// Current version of `name` in `run_id`.
    pub fn get(&self, run_id: &str, name: &str) -> PipelineResult<Arc<ArtifactHandle>> {
        self.lookup(&(run_id.to_string(), name.to_string()))?
            .ok_or_else(|| PipelineError::ArtifactNotFound {
                run_id: run_id.to_string(),
                name: name.to_string(),
            })
    }

    /// Payload bytes of a handle, checked against its digest.
    pub async fn read(&self, handle: &ArtifactHandle) -> PipelineResult<Vec<u8>> {
        self.blobs.get(&handle.payload).await
    }

    /// Current handles of a run, sorted by name.
    pub fn list(&self, run_id: &str) -> PipelineResult<Vec<Arc<ArtifactHandle>>> {
        let current = self.current.read().map_err(|_| poisoned())?;
        let mut handles: Vec<_> = current
            .iter()
            .filter(|((run, _), _)| run == run_id)
            .map(|(_, h)| h.clone())
            .collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(handles)
    }

    /// Drop a finished run from the in-memory index. Handles already held
    /// stay readable, and the state store keeps the metadata.
    pub async fn release_run(&self, run_id: &str) -> PipelineResult<usize> {
        self.writers.lock().await.retain(|(run, _), _| run != run_id);
        let mut current = self.current.write().map_err(|_| poisoned())?;
        let before = current.len();
        current.retain(|(run, _), _| run != run_id);
        let released = before - current.len();
        debug!(run_id, released, "run artifacts released");
        Ok(released)
    }

    fn lookup(&self, key: &ArtifactKey) -> PipelineResult<Option<Arc<ArtifactHandle>>> {
        let current = self.current.read().map_err(|_| poisoned())?;
        Ok(current.get(key).cloned())
    }
}

fn poisoned() -> PipelineError {
    PipelineError::ActionFailed("artifact index lock poisoned".to_string())
}
