//! Durable storage for runner snapshots.
//!
//! A snapshot is the pair of searcher state and search method state that the
//! runner commits after every processed event. It is written as two named
//! files so that either half can be inspected on its own:
//!
//! - `searcher_state.json`: versioned [`PersistedSearcherState`]
//! - `method_state.json`: whatever the search method wrote in `save_state`

use async_trait::async_trait;
use hs_types::{HsResult, PersistedSearcherState, SearcherState, StoreError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const SEARCHER_STATE_FILE: &str = "searcher_state.json";
pub const METHOD_STATE_FILE: &str = "method_state.json";

/// Opaque identifier of a saved snapshot.
pub type SnapshotHandle = String;

/// Named files making up one snapshot.
pub type SnapshotFiles = BTreeMap<String, Vec<u8>>;

/// The unit the runner persists atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSnapshot {
    pub searcher: PersistedSearcherState,
    pub method_state: Vec<u8>,
}

impl RunnerSnapshot {
    pub fn new(method: &str, state: SearcherState, method_state: Vec<u8>) -> Self {
        Self {
            searcher: PersistedSearcherState::new(method, state),
            method_state,
        }
    }

    pub fn state(&self) -> &SearcherState {
        &self.searcher.state
    }

    pub fn to_files(&self) -> HsResult<SnapshotFiles> {
        let mut files = SnapshotFiles::new();
        files.insert(
            SEARCHER_STATE_FILE.to_string(),
            self.searcher.to_json_bytes()?,
        );
        files.insert(METHOD_STATE_FILE.to_string(), self.method_state.clone());
        Ok(files)
    }

    pub fn from_files(files: &SnapshotFiles) -> HsResult<Self> {
        let file = |name: &str| {
            files.get(name).ok_or_else(|| StoreError::Corrupt {
                message: format!("snapshot is missing {name}"),
            })
        };
        let searcher = PersistedSearcherState::from_json_bytes(file(SEARCHER_STATE_FILE)?)?;
        let method_state = file(METHOD_STATE_FILE)?.clone();
        Ok(Self {
            searcher,
            method_state,
        })
    }
}

/// Where the runner keeps its committed snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Durably write `snapshot` and make it the latest one.
    async fn save(&mut self, snapshot: &RunnerSnapshot) -> HsResult<SnapshotHandle>;

    async fn load(&self, handle: &SnapshotHandle) -> HsResult<RunnerSnapshot>;

    /// Handle of the most recently saved snapshot, if any.
    async fn latest(&self) -> HsResult<Option<SnapshotHandle>>;

    async fn load_latest(&self) -> HsResult<Option<RunnerSnapshot>> {
        match self.latest().await? {
            Some(handle) => Ok(Some(self.load(&handle).await?)),
            None => Ok(None),
        }
    }
}

/// Snapshots in a local directory.
///
/// Layout:
/// ```text
/// <root>/latest                      name of the newest snapshot directory
/// <root>/snapshots/<seq>/searcher_state.json
/// <root>/snapshots/<seq>/method_state.json
/// ```
/// Each snapshot is written to a temporary directory and renamed into place,
/// then the `latest` pointer is replaced the same way.
#[derive(Debug, Clone)]
pub struct LocalSnapshotStore {
    root: PathBuf,
    retain: usize,
    next_seq: u64,
}

impl LocalSnapshotStore {
    const LATEST: &'static str = "latest";
    const SNAPSHOTS: &'static str = "snapshots";

    /// Open (or create) a store rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> HsResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(Self::SNAPSHOTS))?;
        let next_seq = Self::existing_seqs(&root)?
            .last()
            .map_or(1, |seq| seq + 1);
        Ok(Self {
            root,
            retain: 3,
            next_seq,
        })
    }

    /// Number of snapshots kept on disk. At least one is always kept.
    pub fn with_retention(mut self, retain: usize) -> Self {
        self.retain = retain.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_dir(&self, handle: &str) -> PathBuf {
        self.root.join(Self::SNAPSHOTS).join(handle)
    }

    fn handle_for(seq: u64) -> SnapshotHandle {
        format!("{seq:010}")
    }

    fn existing_seqs(root: &Path) -> HsResult<Vec<u64>> {
        let mut seqs = Vec::new();
        for entry in std::fs::read_dir(root.join(Self::SNAPSHOTS))? {
            let entry = entry?;
            if let Some(seq) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        Ok(seqs)
    }

    async fn prune(&self) -> HsResult<()> {
        let seqs = Self::existing_seqs(&self.root)?;
        if seqs.len() <= self.retain {
            return Ok(());
        }
        for seq in &seqs[..seqs.len() - self.retain] {
            let dir = self.snapshot_dir(&Self::handle_for(*seq));
            debug!(path = %dir.display(), "pruning old snapshot");
            tokio::fs::remove_dir_all(dir).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for LocalSnapshotStore {
    async fn save(&mut self, snapshot: &RunnerSnapshot) -> HsResult<SnapshotHandle> {
        let handle = Self::handle_for(self.next_seq);
        let final_dir = self.snapshot_dir(&handle);
        let tmp_dir = self.root.join(Self::SNAPSHOTS).join(format!(".tmp-{handle}"));
        if tokio::fs::try_exists(&tmp_dir).await? {
            tokio::fs::remove_dir_all(&tmp_dir).await?;
        }
        tokio::fs::create_dir_all(&tmp_dir).await?;
        for (name, bytes) in snapshot.to_files()? {
            write_synced(&tmp_dir.join(name), &bytes).await?;
        }
        sync_dir(&tmp_dir).await?;
        tokio::fs::rename(&tmp_dir, &final_dir).await?;
        sync_dir(&self.root.join(Self::SNAPSHOTS)).await?;

        let pointer_tmp = self.root.join(".latest.tmp");
        write_synced(&pointer_tmp, handle.as_bytes()).await?;
        tokio::fs::rename(&pointer_tmp, self.root.join(Self::LATEST)).await?;
        sync_dir(&self.root).await?;

        self.next_seq += 1;
        self.prune().await?;
        Ok(handle)
    }

    async fn load(&self, handle: &SnapshotHandle) -> HsResult<RunnerSnapshot> {
        let dir = self.snapshot_dir(handle);
        if !tokio::fs::try_exists(&dir).await? {
            return Err(StoreError::NotFound {
                handle: handle.clone(),
            }
            .into());
        }
        let mut files = SnapshotFiles::new();
        for name in [SEARCHER_STATE_FILE, METHOD_STATE_FILE] {
            let path = dir.join(name);
            if tokio::fs::try_exists(&path).await? {
                files.insert(name.to_string(), tokio::fs::read(&path).await?);
            }
        }
        RunnerSnapshot::from_files(&files)
    }

    async fn latest(&self) -> HsResult<Option<SnapshotHandle>> {
        let pointer = self.root.join(Self::LATEST);
        if !tokio::fs::try_exists(&pointer).await? {
            return Ok(None);
        }
        let handle = tokio::fs::read_to_string(&pointer).await?;
        Ok(Some(handle.trim().to_string()))
    }
}

/// Write `bytes` to `path` and flush them to the device.
async fn write_synced(path: &Path, bytes: &[u8]) -> HsResult<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

/// Flush directory entries so renames into `dir` survive a power loss.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> HsResult<()> {
    tokio::fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> HsResult<()> {
    Ok(())
}

/// Checkpoint upload/download plus an externally tracked "latest" pointer,
/// as offered by a remote experiment platform.
#[async_trait]
pub trait CheckpointStorage: Send + Sync {
    /// Upload a set of named files and return the new checkpoint's id.
    async fn upload(&mut self, files: SnapshotFiles) -> HsResult<String>;

    async fn download(&self, checkpoint: &str) -> HsResult<SnapshotFiles>;

    async fn set_latest(&mut self, checkpoint: &str) -> HsResult<()>;

    async fn latest(&self) -> HsResult<Option<String>>;
}

#[derive(Debug, Default)]
struct CheckpointsInner {
    checkpoints: BTreeMap<String, SnapshotFiles>,
    latest: Option<String>,
    uploads: u64,
}

/// Checkpoint storage held in memory. Clones share the same checkpoints.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStorage {
    inner: Arc<Mutex<CheckpointsInner>>,
}

impl InMemoryCheckpointStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploads(&self) -> u64 {
        self.inner.lock().uploads
    }

    pub fn checkpoint_count(&self) -> usize {
        self.inner.lock().checkpoints.len()
    }
}

#[async_trait]
impl CheckpointStorage for InMemoryCheckpointStorage {
    async fn upload(&mut self, files: SnapshotFiles) -> HsResult<String> {
        let id = Uuid::new_v4().to_string();
        let mut inner = self.inner.lock();
        inner.checkpoints.insert(id.clone(), files);
        inner.uploads += 1;
        Ok(id)
    }

    async fn download(&self, checkpoint: &str) -> HsResult<SnapshotFiles> {
        self.inner
            .lock()
            .checkpoints
            .get(checkpoint)
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound {
                    handle: checkpoint.to_string(),
                }
                .into()
            })
    }

    async fn set_latest(&mut self, checkpoint: &str) -> HsResult<()> {
        let mut inner = self.inner.lock();
        if !inner.checkpoints.contains_key(checkpoint) {
            return Err(StoreError::Backend {
                message: format!("cannot point latest at unknown checkpoint {checkpoint}"),
            }
            .into());
        }
        inner.latest = Some(checkpoint.to_string());
        Ok(())
    }

    async fn latest(&self) -> HsResult<Option<String>> {
        Ok(self.inner.lock().latest.clone())
    }
}

/// Snapshots kept as remote checkpoints.
#[derive(Debug, Clone)]
pub struct RemoteSnapshotStore<C: CheckpointStorage> {
    storage: C,
}

impl<C: CheckpointStorage> RemoteSnapshotStore<C> {
    pub fn new(storage: C) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &C {
        &self.storage
    }
}

#[async_trait]
impl<C: CheckpointStorage> SnapshotStore for RemoteSnapshotStore<C> {
    async fn save(&mut self, snapshot: &RunnerSnapshot) -> HsResult<SnapshotHandle> {
        let checkpoint = self.storage.upload(snapshot.to_files()?).await?;
        self.storage.set_latest(&checkpoint).await?;
        debug!(
            checkpoint = %checkpoint,
            last_event_id = snapshot.state().last_event_id,
            "uploaded searcher checkpoint"
        );
        Ok(checkpoint)
    }

    async fn load(&self, handle: &SnapshotHandle) -> HsResult<RunnerSnapshot> {
        let files = self.storage.download(handle).await?;
        RunnerSnapshot::from_files(&files)
    }

    async fn latest(&self) -> HsResult<Option<SnapshotHandle>> {
        self.storage.latest().await
    }
}
