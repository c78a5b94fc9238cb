//! The registry: the documents a caller has open, plus the builder that
//! opens them.

use crate::backend::{Backend, FileBackend};
use crate::buffer::{BufferContext, BufferGuard};
use crate::collection::{SyncedDict, SyncedList};
use crate::error::{Error, Result};
use crate::flush::BufferMode;
use crate::root::{Kind, Root};
use crate::serializer::JsonSerializer;
use crate::validate::ValidatorChain;
use parking_lot::Mutex;
use shardmap::ShardMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How long a document waits for its resource lock by default.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Open documents sharing one [`BufferContext`].
///
/// Opening a resource that is already open returns a handle onto the same
/// in-memory tree, so callers never hold diverging copies. That holds across
/// registries built on the same context too. Registries with separate
/// contexts play the part of separate processes and only coordinate through
/// the resource lock.
pub struct Registry {
    context: Arc<BufferContext>,
    roots: ShardMap<String, Arc<Root>>,
    open_lock: Mutex<()>,
}

impl Registry {
    /// Registry with a default [`BufferContext`].
    pub fn new() -> Self {
        Self::with_context(BufferContext::new())
    }

    /// Registry sharing an existing context.
    pub fn with_context(context: Arc<BufferContext>) -> Self {
        Self {
            context,
            roots: ShardMap::default(),
            open_lock: Mutex::new(()),
        }
    }

    /// The buffering context every document from this registry uses.
    pub fn context(&self) -> &Arc<BufferContext> {
        &self.context
    }

    // ---- opening ----

    /// Open (or reuse) the JSON object stored at `path`.
    pub fn open_dict(&self, path: impl AsRef<Path>) -> Result<SyncedDict> {
        self.document(path).open_dict()
    }

    /// Open (or reuse) the JSON array stored at `path`.
    pub fn open_list(&self, path: impl AsRef<Path>) -> Result<SyncedList> {
        self.document(path).open_list()
    }

    /// Configure a document backed by the JSON file at `path`.
    pub fn document(&self, path: impl AsRef<Path>) -> DocumentBuilder<'_> {
        DocumentBuilder::new(self, Target::Path(path.as_ref().to_path_buf()))
    }

    /// Configure a document on a custom backend.
    pub fn document_with(&self, backend: impl Backend + 'static) -> DocumentBuilder<'_> {
        DocumentBuilder::new(self, Target::Backend(Box::new(backend)))
    }

    fn open_root(
        &self,
        backend: Box<dyn Backend>,
        kind: Kind,
        opts: RootOptions,
    ) -> Result<Arc<Root>> {
        let _serial = self.open_lock.lock();
        let id = backend.resource().to_owned();
        let root = self.context.document(&id, || {
            Root::open(
                backend,
                kind,
                opts.validators,
                Arc::clone(&self.context),
                opts.mode,
                opts.lock_timeout,
            )
        })?;
        if root.kind() != kind {
            return Err(Error::Config(format!(
                "{} is already open as a {}",
                root.resource(),
                root.kind().name()
            )));
        }
        self.roots.insert(id, Arc::clone(&root));
        Ok(root)
    }

    // ---- lifecycle ----

    /// `true` if `resource` is open in this registry.
    #[must_use]
    pub fn contains(&self, resource: &str) -> bool {
        self.roots.get(&resource.to_owned()).is_some()
    }

    /// Number of open documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// `true` when nothing is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identities of every open document, sorted.
    #[must_use]
    pub fn resources(&self) -> Vec<String> {
        let mut out: Vec<String> = self.roots.iter_snapshot().map(|(k, _)| k).collect();
        out.sort();
        out
    }

    /// Forget `resource`. Existing handles keep working; the next open
    /// through any registry on this context reads it afresh. Returns `false`
    /// if it wasn't open here.
    pub fn release(&self, resource: &str) -> bool {
        let _serial = self.open_lock.lock();
        match self.roots.remove(&resource.to_owned()) {
            Some(root) => {
                self.forget(&root);
                true
            }
            None => false,
        }
    }

    /// Release every document.
    pub fn clear_all(&self) {
        let _serial = self.open_lock.lock();
        for (resource, root) in self.roots.iter_snapshot() {
            self.roots.remove(&resource);
            self.forget(&root);
        }
    }

    fn forget(&self, root: &Arc<Root>) {
        if root.is_dirty() && !self.context.is_pending(root.id()) {
            tracing::warn!(resource = %root.resource(), "released document with unsaved changes");
        }
        self.context.forget(root);
    }

    // ---- buffering shortcuts ----

    /// Open a buffered scope on this registry's context.
    pub fn buffered(&self) -> BufferGuard {
        self.context.buffered()
    }

    /// Run `f` in a buffered scope; see [`BufferContext::with_buffer`].
    pub fn with_buffer<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.context.with_buffer(f)
    }

    /// Flush every pending document now.
    pub fn flush(&self) -> Result<()> {
        self.context.flush()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("open", &self.len())
            .field("context", &self.context)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

enum Target {
    Path(PathBuf),
    Backend(Box<dyn Backend>),
}

struct RootOptions {
    validators: ValidatorChain,
    mode: Option<BufferMode>,
    lock_timeout: Duration,
}

/// Configures and opens a document through a [`Registry`].
///
/// Options only apply when this call actually opens the resource; if it is
/// already open, the existing document is returned as is.
///
/// ```rust,no_run
/// use synced_json::{BufferMode, Registry, ValidatorChain, NoDotInKey};
/// use std::time::Duration;
///
/// let registry = Registry::new();
/// let doc = registry
///     .document("statepoint.json")
///     .pretty(true)
///     .lock_timeout(Duration::from_secs(2))
///     .validators(ValidatorChain::json().with(NoDotInKey))
///     .buffer_mode(BufferMode::SerializedFile)
///     .open_dict()?;
/// # Ok::<(), synced_json::Error>(())
/// ```
pub struct DocumentBuilder<'r> {
    registry: &'r Registry,
    target: Target,
    pretty: bool,
    lock_timeout: Duration,
    validators: Option<ValidatorChain>,
    mode: Option<BufferMode>,
}

impl<'r> DocumentBuilder<'r> {
    fn new(registry: &'r Registry, target: Target) -> Self {
        Self {
            registry,
            target,
            pretty: false,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            validators: None,
            mode: None,
        }
    }

    /// Write human-readable JSON with indentation (default: compact). Only
    /// affects file documents.
    pub fn pretty(mut self, yes: bool) -> Self {
        self.pretty = yes;
        self
    }

    /// Bound on waiting for the resource lock (default: 10 s).
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Validator chain (default: [`ValidatorChain::json`]).
    pub fn validators(mut self, chain: ValidatorChain) -> Self {
        self.validators = Some(chain);
        self
    }

    /// Buffering mode for this document, overriding the context's while a
    /// scope is open. [`BufferMode::Unbuffered`] keeps it write-through even
    /// inside scopes.
    pub fn buffer_mode(mut self, mode: BufferMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Open as a mapping. Missing resources start out as `{}`.
    pub fn open_dict(self) -> Result<SyncedDict> {
        self.open(Kind::Mapping).map(SyncedDict::from_root)
    }

    /// Open as a sequence. Missing resources start out as `[]`.
    pub fn open_list(self) -> Result<SyncedList> {
        self.open(Kind::Sequence).map(SyncedList::from_root)
    }

    fn open(self, kind: Kind) -> Result<Arc<Root>> {
        let backend: Box<dyn Backend> = match self.target {
            Target::Path(path) => {
                let serializer = if self.pretty {
                    JsonSerializer::pretty()
                } else {
                    JsonSerializer::new()
                };
                Box::new(FileBackend::with_serializer(path, serializer)?)
            }
            Target::Backend(backend) => backend,
        };
        let opts = RootOptions {
            validators: self.validators.unwrap_or_default(),
            mode: self.mode,
            lock_timeout: self.lock_timeout,
        };
        self.registry.open_root(backend, kind, opts)
    }
}

impl fmt::Debug for DocumentBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.target {
            Target::Path(p) => p.display().to_string(),
            Target::Backend(b) => b.resource().to_owned(),
        };
        f.debug_struct("DocumentBuilder")
            .field("target", &target)
            .field("pretty", &self.pretty)
            .field("lock_timeout", &self.lock_timeout)
            .field("validators", &self.validators)
            .field("mode", &self.mode)
            .finish()
    }
}
