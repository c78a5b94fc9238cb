//! The root of a synced document: owns the in-memory tree, the dirty flag,
//! and the backend. Every collection handle, nested or not, is a root plus a
//! path into its tree.

use crate::backend::Backend;
use crate::buffer::BufferContext;
use crate::digest::{Digest, Observed};
use crate::error::{Error, Result};
use crate::flush::{BufferMode, Commit, ConflictPolicy};
use crate::validate::ValidatorChain;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Container shape of a document or nested handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Mapping,
    Sequence,
}

impl Kind {
    pub fn empty(self) -> Value {
        match self {
            Kind::Mapping => Value::Object(Map::new()),
            Kind::Sequence => Value::Array(Vec::new()),
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            Kind::Mapping => value.is_object(),
            Kind::Sequence => value.is_array(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::Mapping => "mapping",
            Kind::Sequence => "sequence",
        }
    }
}

/// One step from a container to a child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Key(String),
    Index(usize),
}

/// `b[0].c` style rendering; the root is `$`.
pub(crate) fn render_path(path: &[Segment]) -> String {
    let mut out = String::from("$");
    for seg in path {
        let _ = match seg {
            Segment::Key(k) => write!(out, ".{k}"),
            Segment::Index(i) => write!(out, "[{i}]"),
        };
    }
    out
}

pub(crate) fn resolve<'a>(value: &'a Value, path: &[Segment]) -> Option<&'a Value> {
    path.iter().try_fold(value, |node, seg| match (seg, node) {
        (Segment::Key(k), Value::Object(map)) => map.get(k),
        (Segment::Index(i), Value::Array(items)) => items.get(*i),
        _ => None,
    })
}

pub(crate) fn resolve_mut<'a>(value: &'a mut Value, path: &[Segment]) -> Option<&'a mut Value> {
    path.iter().try_fold(value, |node, seg| match (seg, node) {
        (Segment::Key(k), Value::Object(map)) => map.get_mut(k),
        (Segment::Index(i), Value::Array(items)) => items.get_mut(*i),
        _ => None,
    })
}

struct RootState {
    data: Value,
    dirty: bool,
    seen: Observed,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Shared state behind every handle onto one resource.
pub(crate) struct Root {
    id: u64,
    resource: String,
    kind: Kind,
    backend: Box<dyn Backend>,
    validators: ValidatorChain,
    context: Arc<BufferContext>,
    mode: Option<BufferMode>,
    lock_timeout: Duration,
    state: Mutex<RootState>,
}

impl Root {
    /// Build a root and read the resource once under its lock. A missing
    /// resource starts out as an empty container and is not created until the
    /// first write.
    pub fn open(
        backend: Box<dyn Backend>,
        kind: Kind,
        validators: ValidatorChain,
        context: Arc<BufferContext>,
        mode: Option<BufferMode>,
        lock_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let root = Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            resource: backend.resource().to_owned(),
            kind,
            backend,
            validators,
            context,
            mode,
            lock_timeout,
            state: Mutex::new(RootState {
                data: kind.empty(),
                dirty: false,
                seen: Observed::absent(),
            }),
        };
        {
            let mut state = root.state.lock();
            let _lock = root.backend.acquire_lock(root.lock_timeout)?;
            root.refresh_locked(&mut state)?;
        }
        tracing::debug!(resource = %root.resource, kind = kind.name(), "opened document");
        Ok(Arc::new(root))
    }

    /// Process-unique identity of this root, distinct for two roots on the
    /// same resource.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn validators(&self) -> &ValidatorChain {
        &self.validators
    }

    /// Per-document override of the context's buffering mode.
    pub fn mode_override(&self) -> Option<BufferMode> {
        self.mode
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn detached(&self, path: &[Segment], kind: Kind) -> Error {
        Error::Detached {
            resource: self.resource.clone(),
            path: render_path(path),
            expected: kind.name(),
        }
    }

    /// Run `f` on the container at `path`.
    pub fn read<R>(&self, path: &[Segment], kind: Kind, f: impl FnOnce(&Value) -> R) -> Result<R> {
        let state = self.state.lock();
        match resolve(&state.data, path) {
            Some(node) if kind.matches(node) => Ok(f(node)),
            _ => Err(self.detached(path, kind)),
        }
    }

    /// Apply `op` to the container at `path` under the buffering policy in
    /// force for this document.
    ///
    /// `op` must leave the container untouched when it returns an error.
    pub fn mutate<R>(
        self: &Arc<Self>,
        path: &[Segment],
        kind: Kind,
        op: impl FnOnce(&mut Value) -> Result<R>,
    ) -> Result<R> {
        let mode = self.context.active_mode(self.mode);
        if !mode.is_buffered() {
            return self.mutate_now(path, kind, op);
        }

        let (out, size) = {
            let mut state = self.state.lock();
            let out = self.apply(&mut state.data, path, kind, op)?;
            state.dirty = true;
            let size = if mode.serializes_eagerly() {
                Some(self.backend.serialize(&state.data)?.len())
            } else {
                None
            };
            (out, size)
        };

        if self.context.track(self, size) {
            tracing::debug!(resource = %self.resource, "buffer over capacity, flushing early");
            self.context.flush()?;
        }
        Ok(out)
    }

    // Lock, refresh, apply, write: one lock acquisition so a concurrent
    // writer's update can't slip in between our read and our write.
    fn mutate_now<R>(
        &self,
        path: &[Segment],
        kind: Kind,
        op: impl FnOnce(&mut Value) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock();
        let _lock = self.backend.acquire_lock(self.lock_timeout)?;
        // A dirty root here means an earlier write failed; its change is
        // still only in memory, so don't overwrite it with the backend copy.
        if !state.dirty {
            self.refresh_locked(&mut state)?;
        }
        let out = self.apply(&mut state.data, path, kind, op)?;
        state.dirty = true;
        self.write_locked(&mut state)?;
        Ok(out)
    }

    // Run `op` on the container at `path`, then check the whole document:
    // a change deep in the tree can break a rule only the full tree shows,
    // such as a depth limit. A refused change is rolled back.
    fn apply<R>(
        &self,
        data: &mut Value,
        path: &[Segment],
        kind: Kind,
        op: impl FnOnce(&mut Value) -> Result<R>,
    ) -> Result<R> {
        let target = match resolve_mut(data, path) {
            Some(node) if kind.matches(node) => node,
            _ => return Err(self.detached(path, kind)),
        };
        if self.validators.is_empty() {
            return op(target);
        }
        let saved = target.clone();
        let out = op(target)?;
        if let Err(e) = self.validators.validate(None, data) {
            if let Some(slot) = resolve_mut(data, path) {
                *slot = saved;
            }
            return Err(e.into());
        }
        Ok(out)
    }

    /// Re-read the resource. Inside a buffered scope a document with pending
    /// changes is served from the buffer instead and left as is.
    pub fn load(&self) -> Result<()> {
        if self.context.is_buffered() && self.context.is_pending(self.id) {
            tracing::debug!(resource = %self.resource, "load served from buffer");
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            let _lock = self.backend.acquire_lock(self.lock_timeout)?;
            let bytes = self
                .backend
                .read()?
                .ok_or_else(|| Error::backend(&self.resource, "resource does not exist"))?;
            self.replace_from(&mut state, &bytes)?;
            state.dirty = false;
        }
        self.context.untrack(self.id);
        tracing::debug!(resource = %self.resource, "loaded");
        Ok(())
    }

    /// Drop local changes: reload from the backend, or empty the document if
    /// the resource does not exist.
    pub fn discard(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            let _lock = self.backend.acquire_lock(self.lock_timeout)?;
            match self.backend.read()? {
                Some(bytes) => self.replace_from(&mut state, &bytes)?,
                None => {
                    state.data = self.kind.empty();
                    state.seen = Observed::absent();
                }
            }
            state.dirty = false;
        }
        self.context.untrack(self.id);
        tracing::debug!(resource = %self.resource, "discarded local changes");
        Ok(())
    }

    /// Write the whole document now, whatever the buffering mode. This is an
    /// explicit overwrite: conflict detection does not apply.
    pub fn save(&self) -> Result<()> {
        self.state.lock().dirty = true;
        self.commit(false, ConflictPolicy::LastWriterWins)?;
        self.context.untrack(self.id);
        Ok(())
    }

    /// Flush step for one document: validate, serialize, lock, check for
    /// outside changes, skip or write, mark clean.
    pub fn commit(&self, skip_unchanged: bool, conflict: ConflictPolicy) -> Result<Commit> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(Commit::Clean);
        }
        self.validators.validate(None, &state.data)?;
        let bytes = self.backend.serialize(&state.data)?;
        let digest = Digest::of(&bytes);

        let _lock = self.backend.acquire_lock(self.lock_timeout)?;
        let seen = state.seen;

        if conflict == ConflictPolicy::Detect {
            let current = self.backend.read()?.map(|b| Digest::of(&b));
            if current != seen.raw {
                tracing::warn!(
                    resource = %self.resource,
                    expected = ?seen.raw,
                    found = ?current,
                    "backend changed since last sync"
                );
                return Err(Error::Conflict {
                    resource: self.resource.clone(),
                });
            }
        }

        if skip_unchanged && seen.canonical == Some(digest) {
            state.dirty = false;
            tracing::debug!(resource = %self.resource, %digest, "unchanged, write skipped");
            return Ok(Commit::Unchanged);
        }

        self.backend.write(&bytes)?;
        state.seen = Observed::written(digest);
        state.dirty = false;
        tracing::debug!(resource = %self.resource, bytes = bytes.len(), "written");
        Ok(Commit::Written)
    }

    fn write_locked(&self, state: &mut RootState) -> Result<()> {
        let bytes = self.backend.serialize(&state.data)?;
        self.backend.write(&bytes)?;
        state.seen = Observed::written(Digest::of(&bytes));
        state.dirty = false;
        tracing::debug!(resource = %self.resource, bytes = bytes.len(), "written through");
        Ok(())
    }

    // Caller holds the backend lock.
    fn refresh_locked(&self, state: &mut RootState) -> Result<()> {
        match self.backend.read()? {
            Some(bytes) => self.replace_from(state, &bytes),
            None => {
                state.seen = Observed::absent();
                Ok(())
            }
        }
    }

    fn replace_from(&self, state: &mut RootState, bytes: &[u8]) -> Result<()> {
        let value = self.decode(bytes)?;
        let canonical = Digest::of(&self.backend.serialize(&value)?);
        state.data = value;
        state.seen = Observed {
            raw: Some(Digest::of(bytes)),
            canonical: Some(canonical),
        };
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let value = self.backend.deserialize(bytes)?;
        if !self.kind.matches(&value) {
            return Err(Error::corruption(
                &self.resource,
                format!("expected a {} at the top level", self.kind.name()),
            ));
        }
        self.validators.validate(None, &value)?;
        Ok(value)
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        if self.state.get_mut().dirty {
            tracing::warn!(resource = %self.resource, "dropping document with unsaved changes");
        }
    }
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Root")
            .field("id", &self.id)
            .field("resource", &self.resource)
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(k: &str) -> Segment {
        Segment::Key(k.into())
    }

    #[test]
    fn resolves_mixed_paths() {
        let doc = json!({"a": [{"b": 1}, {"b": 2}]});
        let path = [key("a"), Segment::Index(1), key("b")];
        assert_eq!(resolve(&doc, &path), Some(&json!(2)));
        assert_eq!(resolve(&doc, &[key("a"), Segment::Index(5)]), None);
        assert_eq!(resolve(&doc, &[key("a"), key("b")]), None);
        assert_eq!(resolve(&doc, &[]), Some(&doc));
    }

    #[test]
    fn resolve_mut_reaches_nested_value() {
        let mut doc = json!({"a": {"b": [0, 0]}});
        *resolve_mut(&mut doc, &[key("a"), key("b"), Segment::Index(0)]).unwrap() = json!(9);
        assert_eq!(doc, json!({"a": {"b": [9, 0]}}));
    }

    #[test]
    fn path_rendering() {
        assert_eq!(render_path(&[]), "$");
        assert_eq!(
            render_path(&[key("a"), Segment::Index(0), key("c")]),
            "$.a[0].c"
        );
    }

    #[test]
    fn kinds() {
        assert!(Kind::Mapping.matches(&Kind::Mapping.empty()));
        assert!(!Kind::Mapping.matches(&json!([])));
        assert!(Kind::Sequence.matches(&json!([1])));
    }
}
