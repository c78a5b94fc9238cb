//! Buffered scopes: deferring writes and flushing them in one pass.
//!
//! A [`BufferContext`] is shared by every document opened through the
//! registries built on it, and it keeps one live document per resource for
//! all of them. Scopes nest: each [`BufferGuard`] bumps a
//! depth counter and only the outermost one flushes when it closes.
//!
//! ```rust,no_run
//! use synced_json::Registry;
//!
//! let registry = Registry::new();
//! let doc = registry.open_dict("job.json")?;
//! registry.with_buffer(|| {
//!     for i in 0..100 {
//!         doc.set(format!("step{i}"), i)?;
//!     }
//!     Ok(())
//! })?; // one write here
//! # Ok::<(), synced_json::Error>(())
//! ```
//!
//! Changes buffered in memory are lost if the process dies before the flush.

use crate::error::{Error, FlushError, Result};
use crate::flush::{BufferMode, Commit, ConflictPolicy, ExitPolicy};
use crate::root::Root;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

/// Default byte budget for [`BufferMode::File`] and
/// [`BufferMode::SerializedFile`] before an early flush.
pub const DEFAULT_CAPACITY: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
struct BufferConfig {
    mode: BufferMode,
    capacity: usize,
    conflict: ConflictPolicy,
}

struct Pending {
    root: Arc<Root>,
    bytes: usize,
}

#[derive(Default)]
struct BufferState {
    depth: usize,
    // Keyed by root id, so two roots on one resource never share a slot.
    pending: BTreeMap<u64, Pending>,
    pending_bytes: usize,
}

/// Buffering mode, scope depth, pending documents, and the live document
/// for each open resource.
pub struct BufferContext {
    config: Mutex<BufferConfig>,
    state: Mutex<BufferState>,
    documents: Mutex<HashMap<String, Weak<Root>>>,
}

impl BufferContext {
    /// Context with [`BufferMode::Memory`], default capacity, last writer wins.
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    /// Start configuring a context.
    pub fn builder() -> BufferContextBuilder {
        BufferContextBuilder::default()
    }

    // ---- configuration ----

    /// Mode used by documents without their own override while a scope is open.
    pub fn mode(&self) -> BufferMode {
        self.config.lock().mode
    }

    /// Change the mode. Refused while a scope is open.
    pub fn set_mode(&self, mode: BufferMode) -> Result<()> {
        if self.depth() > 0 {
            return Err(Error::Config(
                "can't change buffer mode inside a buffered scope".into(),
            ));
        }
        self.config.lock().mode = mode;
        Ok(())
    }

    /// How flushes treat outside changes.
    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.config.lock().conflict
    }

    /// Change the conflict policy; applies from the next flush.
    pub fn set_conflict_policy(&self, policy: ConflictPolicy) {
        self.config.lock().conflict = policy;
    }

    /// Byte budget for eagerly serializing modes.
    pub fn capacity(&self) -> usize {
        self.config.lock().capacity
    }

    // ---- scopes ----

    /// Current nesting depth; 0 means unbuffered.
    pub fn depth(&self) -> usize {
        self.state.lock().depth
    }

    /// `true` while at least one scope is open.
    pub fn is_buffered(&self) -> bool {
        self.depth() > 0
    }

    /// Open a scope and return the new depth. Pair with
    /// [`exit_buffered`](Self::exit_buffered); prefer [`buffered`](Self::buffered).
    pub fn enter_buffered(&self) -> usize {
        let mut state = self.state.lock();
        state.depth += 1;
        tracing::trace!(depth = state.depth, "entered buffered scope");
        state.depth
    }

    /// Close a scope. Closing the outermost one flushes every pending document.
    pub fn exit_buffered(&self) -> Result<()> {
        if self.leave()? {
            self.flush()
        } else {
            Ok(())
        }
    }

    // Decrement depth; `true` if that closed the outermost scope.
    fn leave(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.depth == 0 {
            return Err(Error::Config(
                "exit_buffered called without a matching enter_buffered".into(),
            ));
        }
        state.depth -= 1;
        tracing::trace!(depth = state.depth, "left buffered scope");
        Ok(state.depth == 0)
    }

    /// Open a scope that closes when the guard is finished or dropped.
    pub fn buffered(self: &Arc<Self>) -> BufferGuard {
        self.enter_buffered();
        BufferGuard {
            context: Arc::clone(self),
            active: true,
        }
    }

    /// Run `f` inside a scope. The scope flushes on the way out whether `f`
    /// succeeded, failed, or panicked.
    ///
    /// An error from `f` takes precedence over a flush error; the flush error
    /// is logged in that case.
    pub fn with_buffer<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.with_buffer_policy(ExitPolicy::FlushAlways, f)
    }

    /// [`with_buffer`](Self::with_buffer) with an explicit choice of what an
    /// error from `f` does to pending changes.
    pub fn with_buffer_policy<T, F>(self: &Arc<Self>, policy: ExitPolicy, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let guard = self.buffered();
        let out = f();

        if out.is_err() && policy == ExitPolicy::DiscardOnError {
            if guard.abandon()? {
                if let Err(e) = self.discard() {
                    tracing::error!(error = %e, "discarding pending changes failed");
                }
            }
            return out;
        }

        match (out, guard.finish()) {
            (Ok(v), Ok(())) => Ok(v),
            (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
            (Err(e), Err(flush_err)) => {
                tracing::error!(error = %flush_err, "flush after failed scope also failed");
                Err(e)
            }
        }
    }

    // ---- flushing ----

    /// Write every pending document now.
    ///
    /// Each document is committed on its own; a failure doesn't stop the
    /// others. Failures come back together as [`Error::Flush`] and the failed
    /// documents stay pending, so calling `flush` again retries just them.
    pub fn flush(&self) -> Result<()> {
        let pending: Vec<Arc<Root>> = {
            let mut state = self.state.lock();
            state.pending_bytes = 0;
            std::mem::take(&mut state.pending)
                .into_values()
                .map(|p| p.root)
                .collect()
        };
        if pending.is_empty() {
            return Ok(());
        }

        let config = *self.config.lock();
        let (mut written, mut unchanged) = (0usize, 0usize);
        let mut failures = Vec::new();
        for root in pending {
            let mode = root.mode_override().unwrap_or(config.mode);
            match root.commit(mode.skips_unchanged(), config.conflict) {
                Ok(Commit::Written) => written += 1,
                Ok(Commit::Unchanged) => unchanged += 1,
                Ok(Commit::Clean) => {}
                Err(e) => {
                    tracing::warn!(resource = %root.resource(), error = %e, "flush failed");
                    failures.push((root.resource().to_owned(), e));
                    self.retrack(root);
                }
            }
        }
        tracing::info!(written, unchanged, failed = failures.len(), "flushed buffer");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Flush(FlushError::new(failures)))
        }
    }

    /// Drop every pending change by reloading the affected documents.
    pub fn discard(&self) -> Result<()> {
        let pending: Vec<Arc<Root>> = {
            let mut state = self.state.lock();
            state.pending_bytes = 0;
            std::mem::take(&mut state.pending)
                .into_values()
                .map(|p| p.root)
                .collect()
        };
        let mut failures = Vec::new();
        for root in pending {
            if let Err(e) = root.discard() {
                failures.push((root.resource().to_owned(), e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Flush(FlushError::new(failures)))
        }
    }

    /// Resources with changes waiting for a flush, sorted.
    pub fn pending_resources(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .state
            .lock()
            .pending
            .values()
            .map(|p| p.root.resource().to_owned())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Serialized bytes held for eagerly serializing modes.
    pub fn pending_bytes(&self) -> usize {
        self.state.lock().pending_bytes
    }

    /// Forget everything: close all scopes and drop pending changes without
    /// writing them. Open documents keep their in-memory contents.
    pub fn reset(&self) {
        let dropped = {
            let mut state = self.state.lock();
            state.depth = 0;
            state.pending_bytes = 0;
            std::mem::take(&mut state.pending)
        };
        if !dropped.is_empty() {
            tracing::warn!(count = dropped.len(), "reset dropped pending documents");
        }
        drop(dropped);
    }

    // ---- bookkeeping used by documents ----

    /// The live root for `resource`, or a new one from `open` if none is.
    /// Every registry on this context goes through here, so they all share
    /// one in-memory tree per resource.
    pub(crate) fn document(
        &self,
        resource: &str,
        open: impl FnOnce() -> Result<Arc<Root>>,
    ) -> Result<Arc<Root>> {
        let mut documents = self.documents.lock();
        if let Some(root) = documents.get(resource).and_then(Weak::upgrade) {
            tracing::trace!(resource, "reusing open document");
            return Ok(root);
        }
        documents.retain(|_, weak| weak.strong_count() > 0);
        let root = open()?;
        documents.insert(resource.to_owned(), Arc::downgrade(&root));
        Ok(root)
    }

    /// Drop the context's entry for `root`, so the next open reads afresh.
    pub(crate) fn forget(&self, root: &Arc<Root>) {
        let mut documents = self.documents.lock();
        let same = documents
            .get(root.resource())
            .map_or(false, |weak| weak.as_ptr() == Arc::as_ptr(root));
        if same {
            documents.remove(root.resource());
        }
    }

    pub(crate) fn active_mode(&self, over: Option<BufferMode>) -> BufferMode {
        if self.is_buffered() {
            over.unwrap_or_else(|| self.mode())
        } else {
            BufferMode::Unbuffered
        }
    }

    /// Mark `root` pending. `size` is its serialized length for eagerly
    /// serializing modes. Returns `true` once the buffer is over capacity.
    pub(crate) fn track(&self, root: &Arc<Root>, size: Option<usize>) -> bool {
        let capacity = self.capacity();
        let mut state = self.state.lock();
        let BufferState {
            pending,
            pending_bytes,
            ..
        } = &mut *state;
        let entry = pending.entry(root.id()).or_insert_with(|| Pending {
                root: Arc::clone(root),
                bytes: 0,
            });
        let size = size.unwrap_or(0);
        *pending_bytes = *pending_bytes - entry.bytes + size;
        entry.bytes = size;
        *pending_bytes > capacity
    }

    pub(crate) fn untrack(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some(p) = state.pending.remove(&id) {
            state.pending_bytes -= p.bytes;
        }
    }

    pub(crate) fn is_pending(&self, id: u64) -> bool {
        self.state.lock().pending.contains_key(&id)
    }

    fn retrack(&self, root: Arc<Root>) {
        self.state
            .lock()
            .pending
            .insert(root.id(), Pending { root, bytes: 0 });
    }
}

impl fmt::Debug for BufferContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = *self.config.lock();
        let state = self.state.lock();
        f.debug_struct("BufferContext")
            .field("mode", &config.mode)
            .field("conflict", &config.conflict)
            .field("depth", &state.depth)
            .field("pending", &state.pending.len())
            .field("documents", &self.documents.lock().len())
            .finish_non_exhaustive()
    }
}

/// Configures a [`BufferContext`].
///
/// ```rust
/// use synced_json::{BufferContext, BufferMode, ConflictPolicy};
///
/// let ctx = BufferContext::builder()
///     .mode(BufferMode::SerializedFile)
///     .conflict_policy(ConflictPolicy::Detect)
///     .build();
/// assert_eq!(ctx.mode(), BufferMode::SerializedFile);
/// ```
#[derive(Debug, Clone)]
pub struct BufferContextBuilder {
    config: BufferConfig,
}

impl Default for BufferContextBuilder {
    fn default() -> Self {
        Self {
            config: BufferConfig {
                mode: BufferMode::default(),
                capacity: DEFAULT_CAPACITY,
                conflict: ConflictPolicy::default(),
            },
        }
    }
}

impl BufferContextBuilder {
    /// Mode for buffered scopes (default: [`BufferMode::Memory`]).
    pub fn mode(mut self, mode: BufferMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Byte budget before an early flush (default: 32 MiB).
    pub fn capacity(mut self, bytes: usize) -> Self {
        self.config.capacity = bytes;
        self
    }

    /// Conflict handling at flush (default: last writer wins).
    pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.config.conflict = policy;
        self
    }

    /// Finish.
    pub fn build(self) -> Arc<BufferContext> {
        Arc::new(BufferContext {
            config: Mutex::new(self.config),
            state: Mutex::new(BufferState::default()),
            documents: Mutex::new(HashMap::new()),
        })
    }
}

/// An open buffered scope.
///
/// Call [`finish`](Self::finish) to close it and see the flush result.
/// Dropping it also closes it, but a flush failure can then only be logged.
#[must_use = "the scope closes as soon as the guard is dropped"]
pub struct BufferGuard {
    context: Arc<BufferContext>,
    active: bool,
}

impl BufferGuard {
    /// The context this scope belongs to.
    pub fn context(&self) -> &Arc<BufferContext> {
        &self.context
    }

    /// Close the scope, flushing if it was the outermost one.
    pub fn finish(mut self) -> Result<()> {
        self.active = false;
        self.context.exit_buffered()
    }

    // Close without flushing; `true` if it was the outermost scope.
    fn abandon(mut self) -> Result<bool> {
        self.active = false;
        self.context.leave()
    }
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.context.exit_buffered() {
                tracing::error!(error = %e, "flush on scope exit failed");
            }
        }
    }
}

impl fmt::Debug for BufferGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferGuard")
            .field("depth", &self.context.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_tracks_nesting() {
        let ctx = BufferContext::new();
        assert!(!ctx.is_buffered());
        let outer = ctx.buffered();
        let inner = ctx.buffered();
        assert_eq!(ctx.depth(), 2);
        inner.finish().unwrap();
        assert_eq!(ctx.depth(), 1);
        drop(outer);
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn unmatched_exit_is_a_config_error() {
        let ctx = BufferContext::new();
        assert!(matches!(ctx.exit_buffered(), Err(Error::Config(_))));
    }

    #[test]
    fn mode_locked_inside_scope() {
        let ctx = BufferContext::new();
        let guard = ctx.buffered();
        assert!(ctx.set_mode(BufferMode::File).is_err());
        guard.finish().unwrap();
        ctx.set_mode(BufferMode::File).unwrap();
        assert_eq!(ctx.mode(), BufferMode::File);
    }

    #[test]
    fn active_mode_is_unbuffered_outside_scopes() {
        let ctx = BufferContext::builder().mode(BufferMode::File).build();
        assert_eq!(ctx.active_mode(None), BufferMode::Unbuffered);
        let _g = ctx.buffered();
        assert_eq!(ctx.active_mode(None), BufferMode::File);
        assert_eq!(
            ctx.active_mode(Some(BufferMode::Unbuffered)),
            BufferMode::Unbuffered
        );
    }

    #[test]
    fn with_buffer_returns_closure_error() {
        let ctx = BufferContext::new();
        let out: Result<()> = ctx.with_buffer(|| Err(Error::KeyNotFound("x".into())));
        assert_eq!(out, Err(Error::KeyNotFound("x".into())));
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn reset_closes_scopes() {
        let ctx = BufferContext::new();
        ctx.enter_buffered();
        ctx.enter_buffered();
        ctx.reset();
        assert_eq!(ctx.depth(), 0);
        assert!(ctx.pending_resources().is_empty());
    }
}
