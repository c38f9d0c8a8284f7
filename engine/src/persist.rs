//! Durable storage for engine snapshots.
//!
//! The on-device backend is a plain key-value byte store ([`KeyValueStore`]).
//! [`DurableStore`] binds a backend to a store name and the snapshot codec.

use crate::{error::Result, Error, Snapshot};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Default key under which the engine persists its snapshot.
pub const DEFAULT_STORE_NAME: &str = "posts";

/// A durable key-value byte store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the bytes stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the bytes stored under `key`.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
}

/// In-memory backend with fault injection, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Raw bytes under a key.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(key).cloned()
    }

    /// Overwrite raw bytes under a key, bypassing the codec.
    pub fn set_raw(&self, key: &str, value: Vec<u8>) {
        self.entries.lock().insert(key.to_string(), value);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check()?;
        self.entries.lock().insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// File-backed store: one `<key>.json` file per key inside a directory.
///
/// Writes go to a temporary sibling file that is then renamed over the
/// target, so a crash mid-write leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

fn io_error(context: &str, e: std::io::Error) -> Error {
    Error::StoreUnavailable(format!("{}: {}", context, e))
}

#[async_trait]
impl KeyValueStore for FileKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read failed", e)),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error("create dir failed", e))?;

        let target = self.path_for(key);
        let tmp = self.dir.join(format!(".{}.json.tmp", key));
        tokio::fs::write(&tmp, &value)
            .await
            .map_err(|e| io_error("write failed", e))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| io_error("rename failed", e))?;
        Ok(())
    }
}

/// Snapshot persistence under a single named key.
#[derive(Clone)]
pub struct DurableStore {
    backend: Arc<dyn KeyValueStore>,
    name: String,
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore").field("name", &self.name).finish()
    }
}

impl DurableStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, name: impl Into<String>) -> Self {
        Self {
            backend,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Load the last saved snapshot, or `None` if nothing was ever saved.
    pub async fn load(&self) -> Result<Option<Snapshot>> {
        match self.backend.get(&self.name).await? {
            Some(bytes) => Snapshot::from_bytes(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Key that receives an undecodable snapshot.
    pub fn corrupt_key(&self) -> String {
        format!("{}.corrupt", self.name)
    }

    /// Copy the stored bytes under [`corrupt_key`](Self::corrupt_key) so a
    /// fresh snapshot can replace them without losing the original.
    pub async fn quarantine(&self) -> Result<()> {
        if let Some(bytes) = self.backend.get(&self.name).await? {
            self.backend.put(&self.corrupt_key(), bytes).await?;
        }
        Ok(())
    }

    /// Persist a snapshot, replacing the previous one.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = snapshot.to_bytes()?;
        self.backend.put(&self.name, bytes).await
    }
}
