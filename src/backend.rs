//! Pluggable storage backends.
//!
//! Implement [`Backend`] to keep documents somewhere other than a local JSON
//! file. The core only ever exchanges whole documents with a backend, so the
//! contract is small: read, atomic write, lock, and a codec.

use crate::error::{Error, Result};
use crate::persist::{atomic_write, read_optional, sibling, FileLock};
use crate::serializer::{JsonSerializer, Serializer};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Held advisory lock on one resource. Dropping it releases the lock.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    _held: Box<dyn Send>,
}

impl LockGuard {
    /// Wrap whatever keeps the lock alive; its `Drop` must release it.
    pub fn new<T: Send + 'static>(held: T) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

/// Storage for exactly one document.
///
/// `write` must be atomic from the point of view of any concurrent reader:
/// they see the previous bytes or the new ones, never a mix. The lock
/// returned by `acquire_lock` is advisory and brackets one read-modify-write
/// transaction; other processes only respect it if they use it too.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Stable identity of the resource, e.g. an absolute path.
    fn resource(&self) -> &str;

    /// Codec used to turn documents into bytes and back.
    fn serializer(&self) -> &dyn Serializer;

    /// Current bytes, or `None` if the resource does not exist yet.
    fn read(&self) -> Result<Option<Vec<u8>>>;

    /// Replace the resource with `bytes` in one step.
    fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Block until the resource lock is held or `timeout` expires, in which
    /// case this returns [`Error::LockTimeout`].
    fn acquire_lock(&self, timeout: Duration) -> Result<LockGuard>;

    /// Encode a document with this backend's codec.
    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        self.serializer().serialize(value)
    }

    /// Decode a document with this backend's codec. Decoder failures are
    /// reported as corruption of this resource.
    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        self.serializer().deserialize(bytes).map_err(|e| match e {
            Error::Corruption { message, .. } => Error::corruption(self.resource(), message),
            other => other,
        })
    }
}

// ---- local JSON file ---------------------------------------------------------

/// One JSON file on local disk.
///
/// Writes go through `<file>.tmp` and a rename. The lock is `<file>.lock`,
/// created exclusively and removed when released.
pub struct FileBackend {
    path: PathBuf,
    lock_path: PathBuf,
    resource: String,
    serializer: JsonSerializer,
}

impl FileBackend {
    /// Compact JSON file at `path`. Relative paths are resolved against the
    /// current directory so the resource identity is stable.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_serializer(path, JsonSerializer::new())
    }

    /// File at `path` written with `serializer` (e.g. pretty JSON).
    pub fn with_serializer(path: impl AsRef<Path>, serializer: JsonSerializer) -> Result<Self> {
        let path = absolute(path.as_ref())?;
        Ok(Self {
            lock_path: sibling(&path, "lock"),
            resource: path.display().to_string(),
            path,
            serializer,
        })
    }

    /// Path to the backing JSON file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Backend for FileBackend {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn serializer(&self) -> &dyn Serializer {
        &self.serializer
    }

    fn read(&self) -> Result<Option<Vec<u8>>> {
        read_optional(&self.path)
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        atomic_write(&self.path, bytes)
    }

    fn acquire_lock(&self, timeout: Duration) -> Result<LockGuard> {
        match FileLock::acquire(&self.lock_path, timeout)? {
            Some(lock) => Ok(LockGuard::new(lock)),
            None => Err(Error::LockTimeout {
                resource: self.resource.clone(),
                timeout,
            }),
        }
    }
}

impl fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBackend")
            .field("path", &self.path)
            .field("pretty", &self.serializer.is_pretty())
            .finish()
    }
}

/// Join relative paths onto the current directory and drop `.` components.
/// Symlinks are left alone: the file may not exist yet.
pub(crate) fn absolute(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| Error::backend(path.display().to_string(), e))?
            .join(path)
    };
    let mut out = PathBuf::new();
    for comp in joined.components() {
        match comp {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    if out.file_name().is_none() {
        return Err(Error::Config(format!(
            "{} does not name a file",
            path.display()
        )));
    }
    Ok(out)
}

// ---- in-memory store ---------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    docs: HashMap<String, Vec<u8>>,
    writes: HashMap<String, u64>,
    locked: HashSet<String>,
}

/// Shared in-memory document store standing in for a remote document
/// service: every document is a key, every write replaces it in one step.
///
/// Cloning shares the store. It also counts writes per key, which is handy
/// for checking how much I/O a buffering mode really does.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<(Mutex<StoreInner>, Condvar)>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend for the document under `key`.
    pub fn backend(&self, key: impl Into<String>) -> MemoryBackend {
        MemoryBackend {
            store: self.clone(),
            key: key.into(),
            serializer: JsonSerializer::new(),
        }
    }

    /// Raw bytes under `key`, if any.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.0.lock().docs.get(key).cloned()
    }

    /// Replace `key` directly, bypassing any lock. Simulates another writer.
    pub fn put(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        self.inner.0.lock().docs.insert(key.to_owned(), bytes.into());
    }

    /// How many backend writes `key` has received.
    pub fn write_count(&self, key: &str) -> u64 {
        self.inner.0.lock().writes.get(key).copied().unwrap_or(0)
    }

    /// `true` while someone holds the lock on `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        self.inner.0.lock().locked.contains(key)
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.0.lock();
        f.debug_struct("MemoryStore")
            .field("docs", &inner.docs.len())
            .field("locked", &inner.locked.len())
            .finish()
    }
}

/// One document inside a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryBackend {
    store: MemoryStore,
    key: String,
    serializer: JsonSerializer,
}

impl MemoryBackend {
    /// The store this backend writes into.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

struct MemoryLock {
    store: MemoryStore,
    key: String,
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.store.inner;
        lock.lock().locked.remove(&self.key);
        cvar.notify_all();
    }
}

impl Backend for MemoryBackend {
    fn resource(&self) -> &str {
        &self.key
    }

    fn serializer(&self) -> &dyn Serializer {
        &self.serializer
    }

    fn read(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.store.get(&self.key))
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut inner = self.store.inner.0.lock();
        inner.docs.insert(self.key.clone(), bytes.to_vec());
        *inner.writes.entry(self.key.clone()).or_insert(0) += 1;
        Ok(())
    }

    fn acquire_lock(&self, timeout: Duration) -> Result<LockGuard> {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.store.inner;
        let mut inner = lock.lock();
        while inner.locked.contains(&self.key) {
            if cvar.wait_until(&mut inner, deadline).timed_out()
                && inner.locked.contains(&self.key)
            {
                return Err(Error::LockTimeout {
                    resource: self.key.clone(),
                    timeout,
                });
            }
        }
        inner.locked.insert(self.key.clone());
        Ok(LockGuard::new(MemoryLock {
            store: self.store.clone(),
            key: self.key.clone(),
        }))
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
