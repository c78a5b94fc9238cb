//! Mapping and sequence handles onto a synced document.
//!
//! A handle is a root plus a path. Nested handles come from [`Item`] and are
//! never cached: each access resolves the path against the current tree, so
//! replacing a nested value is visible to the next access and an old handle
//! whose path no longer leads to a container fails with
//! [`Error::Detached`].

use crate::error::{Error, Result, ValidationError};
use crate::root::{render_path, Kind, Root, Segment};
use crate::validate::{to_candidate, Key};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// What a lookup found: a scalar copy, or a live handle onto a nested
/// container.
#[derive(Debug, Clone)]
pub enum Item {
    /// String, number, boolean, or null.
    Scalar(Value),
    /// Nested mapping.
    Dict(SyncedDict),
    /// Nested sequence.
    List(SyncedList),
}

impl Item {
    fn wrap(root: &Arc<Root>, path: Vec<Segment>, value: &Value) -> Self {
        match value {
            Value::Object(_) => Item::Dict(SyncedDict {
                root: Arc::clone(root),
                path,
            }),
            Value::Array(_) => Item::List(SyncedList {
                root: Arc::clone(root),
                path,
            }),
            scalar => Item::Scalar(scalar.clone()),
        }
    }

    /// Plain value, copying nested containers out of the document.
    pub fn into_value(self) -> Result<Value> {
        match self {
            Item::Scalar(v) => Ok(v),
            Item::Dict(d) => d.to_value(),
            Item::List(l) => l.to_value(),
        }
    }

    /// The scalar, if this is one.
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Item::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// The nested mapping handle, if this is one.
    pub fn into_dict(self) -> Option<SyncedDict> {
        match self {
            Item::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// The nested sequence handle, if this is one.
    pub fn into_list(self) -> Option<SyncedList> {
        match self {
            Item::List(l) => Some(l),
            _ => None,
        }
    }
}

fn child_path(path: &[Segment], seg: Segment) -> Vec<Segment> {
    let mut out = Vec::with_capacity(path.len() + 1);
    out.extend_from_slice(path);
    out.push(seg);
    out
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Decode(e.to_string()))
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// A JSON object kept in sync with its backend.
///
/// Reads come from memory. Writes follow the buffering policy in force:
/// outside a buffered scope every write is an immediate locked
/// read-modify-write against the backend.
#[derive(Clone)]
pub struct SyncedDict {
    pub(crate) root: Arc<Root>,
    pub(crate) path: Vec<Segment>,
}

impl SyncedDict {
    pub(crate) fn from_root(root: Arc<Root>) -> Self {
        Self {
            root,
            path: Vec::new(),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&Map<String, Value>) -> R) -> Result<R> {
        self.root.read(&self.path, Kind::Mapping, |v| match v {
            Value::Object(map) => Some(f(map)),
            _ => None,
        })?
        .ok_or_else(|| self.root.detached(&self.path, Kind::Mapping))
    }

    fn mutate<R>(&self, op: impl FnOnce(&mut Map<String, Value>) -> Result<R>) -> Result<R> {
        let detached = || self.root.detached(&self.path, Kind::Mapping);
        self.root
            .mutate(&self.path, Kind::Mapping, |v| match v {
                Value::Object(map) => op(map),
                _ => Err(detached()),
            })
    }

    // ---- identity ----

    /// Identity of the backing resource.
    pub fn resource(&self) -> &str {
        self.root.resource()
    }

    /// `true` for the document itself, `false` for nested handles.
    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// Where this handle points inside the document, e.g. `$.b.c`.
    pub fn location(&self) -> String {
        render_path(&self.path)
    }

    /// `true` when the document has changes the backend hasn't seen.
    /// Shared by every handle onto the same document.
    pub fn is_dirty(&self) -> bool {
        self.root.is_dirty()
    }

    // ---- reads ----

    /// Look up `key`. Nested containers come back as live handles.
    pub fn get(&self, key: impl Into<Key>) -> Result<Option<Item>> {
        let key = key.into().into_string();
        self.read(|map| {
            map.get(&key)
                .map(|v| Item::wrap(&self.root, child_path(&self.path, Segment::Key(key.clone())), v))
        })
    }

    /// Copy of the value under `key`.
    pub fn get_value(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        self.read(|map| map.get(key.as_str()).cloned())
    }

    /// Value under `key` decoded as `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: impl Into<Key>) -> Result<Option<T>> {
        self.get_value(key)?.map(decode).transpose()
    }

    /// Handle onto the nested mapping under `key`.
    pub fn dict(&self, key: impl Into<Key>) -> Result<SyncedDict> {
        let key = key.into().into_string();
        let path = child_path(&self.path, Segment::Key(key.clone()));
        match self.get(key.as_str())? {
            Some(Item::Dict(d)) => Ok(d),
            Some(_) => Err(self.root.detached(&path, Kind::Mapping)),
            None => Err(Error::KeyNotFound(key)),
        }
    }

    /// Handle onto the nested sequence under `key`.
    pub fn list(&self, key: impl Into<Key>) -> Result<SyncedList> {
        let key = key.into().into_string();
        let path = child_path(&self.path, Segment::Key(key.clone()));
        match self.get(key.as_str())? {
            Some(Item::List(l)) => Ok(l),
            Some(_) => Err(self.root.detached(&path, Kind::Sequence)),
            None => Err(Error::KeyNotFound(key)),
        }
    }

    /// `true` if `key` is present.
    pub fn contains_key(&self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        self.read(|map| map.contains_key(key.as_str()))
    }

    /// Number of entries.
    pub fn len(&self) -> Result<usize> {
        self.read(|map| map.len())
    }

    /// `true` when there are no entries.
    pub fn is_empty(&self) -> Result<bool> {
        self.read(|map| map.is_empty())
    }

    /// Snapshot of all keys, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.read(|map| map.keys().cloned().collect())
    }

    /// Snapshot of all values, in key order.
    pub fn values(&self) -> Result<Vec<Value>> {
        self.read(|map| map.values().cloned().collect())
    }

    /// Snapshot of all entries, in key order.
    pub fn iter(&self) -> Result<Vec<(String, Value)>> {
        self.read(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Copy of the whole mapping.
    pub fn to_value(&self) -> Result<Value> {
        self.read(|map| Value::Object(map.clone()))
    }

    // ---- writes ----

    /// Store `value` under `key`, returning the previous value.
    pub fn set(&self, key: impl Into<Key>, value: impl Serialize) -> Result<Option<Value>> {
        let key = key.into().into_string();
        let value = to_candidate(&value)?;
        self.root.validators().validate(Some(&key), &value)?;
        self.mutate(|map| Ok(map.insert(key, value)))
    }

    /// Remove `key`, returning its value if it was present.
    pub fn remove(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        self.mutate(|map| Ok(map.remove(key.as_str())))
    }

    /// Remove `key`; [`Error::KeyNotFound`] if it wasn't there.
    pub fn delete(&self, key: impl Into<Key>) -> Result<Value> {
        let key = key.into().into_string();
        self.mutate(|map| map.remove(&key).ok_or(Error::KeyNotFound(key)))
    }

    /// Insert many entries with a single write. All of them are validated
    /// before any is applied.
    pub fn update<I, K, V>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Key>,
        V: Serialize,
    {
        let validators = self.root.validators();
        let mut batch = Vec::new();
        for (k, v) in entries {
            let k = k.into().into_string();
            let v = to_candidate(&v)?;
            validators.validate(Some(&k), &v)?;
            batch.push((k, v));
        }
        self.mutate(|map| {
            map.extend(batch);
            Ok(())
        })
    }

    /// Drop all entries.
    pub fn clear(&self) -> Result<()> {
        self.mutate(|map| {
            map.clear();
            Ok(())
        })
    }

    /// Value under `key`, inserting `default` first if it's missing.
    pub fn set_default(&self, key: impl Into<Key>, default: impl Serialize) -> Result<Value> {
        let key = key.into().into_string();
        if let Some(v) = self.get_value(key.as_str())? {
            return Ok(v);
        }
        let default = to_candidate(&default)?;
        self.root.validators().validate(Some(&key), &default)?;
        self.mutate(|map| Ok(map.entry(key).or_insert(default).clone()))
    }

    /// Replace the value under `key` with `f(current)`.
    ///
    /// Outside a buffered scope `f` runs while the resource is locked and
    /// just after it was re-read, so concurrent writers in other processes
    /// can't lose each other's updates. Returns the stored value.
    pub fn modify<F, V>(&self, key: impl Into<Key>, f: F) -> Result<Value>
    where
        F: FnOnce(Option<&Value>) -> V,
        V: Serialize,
    {
        let key = key.into().into_string();
        let validators = self.root.validators();
        self.mutate(|map| {
            let next = to_candidate(&f(map.get(&key)))?;
            validators.validate(Some(&key), &next)?;
            map.insert(key, next.clone());
            Ok(next)
        })
    }

    /// Replace the whole mapping. `value` must serialize to a JSON object.
    pub fn reset(&self, value: impl Serialize) -> Result<()> {
        let value = to_candidate(&value)?;
        let Value::Object(new) = value else {
            return Err(ValidationError::UnsupportedValue(
                "a mapping can only be reset to an object".into(),
            )
            .into());
        };
        let validators = self.root.validators();
        for (k, v) in &new {
            validators.validate(Some(k), v)?;
        }
        self.mutate(|map| {
            *map = new;
            Ok(())
        })
    }

    // ---- persistence ----

    /// Re-read the document from the backend.
    pub fn load(&self) -> Result<()> {
        self.root.load()
    }

    /// Write the whole document now. Nested handles save their root.
    pub fn save(&self) -> Result<()> {
        self.root.save()
    }

    /// Throw away unsaved changes by reloading from the backend.
    pub fn discard(&self) -> Result<()> {
        self.root.discard()
    }
}

impl PartialEq<Value> for SyncedDict {
    fn eq(&self, other: &Value) -> bool {
        self.to_value().map_or(false, |v| &v == other)
    }
}

impl PartialEq for SyncedDict {
    fn eq(&self, other: &Self) -> bool {
        match (self.to_value(), other.to_value()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for SyncedDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedDict")
            .field("resource", &self.resource())
            .field("location", &self.location())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Sequence
// ---------------------------------------------------------------------------

/// A JSON array kept in sync with its backend.
///
/// Nested handles address elements by index, so after an insert or removal
/// in front of an element its old handle points at a different element.
#[derive(Clone)]
pub struct SyncedList {
    pub(crate) root: Arc<Root>,
    pub(crate) path: Vec<Segment>,
}

impl SyncedList {
    pub(crate) fn from_root(root: Arc<Root>) -> Self {
        Self {
            root,
            path: Vec::new(),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&Vec<Value>) -> R) -> Result<R> {
        self.root.read(&self.path, Kind::Sequence, |v| match v {
            Value::Array(items) => Some(f(items)),
            _ => None,
        })?
        .ok_or_else(|| self.root.detached(&self.path, Kind::Sequence))
    }

    fn mutate<R>(&self, op: impl FnOnce(&mut Vec<Value>) -> Result<R>) -> Result<R> {
        let detached = || self.root.detached(&self.path, Kind::Sequence);
        self.root
            .mutate(&self.path, Kind::Sequence, |v| match v {
                Value::Array(items) => op(items),
                _ => Err(detached()),
            })
    }

    fn candidate(&self, value: impl Serialize) -> Result<Value> {
        let value = to_candidate(&value)?;
        self.root.validators().validate(None, &value)?;
        Ok(value)
    }

    // ---- identity ----

    /// Identity of the backing resource.
    pub fn resource(&self) -> &str {
        self.root.resource()
    }

    /// `true` for the document itself, `false` for nested handles.
    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// Where this handle points inside the document, e.g. `$.runs[2]`.
    pub fn location(&self) -> String {
        render_path(&self.path)
    }

    /// `true` when the document has changes the backend hasn't seen.
    pub fn is_dirty(&self) -> bool {
        self.root.is_dirty()
    }

    // ---- reads ----

    /// Element at `index`. Nested containers come back as live handles.
    pub fn get(&self, index: usize) -> Result<Option<Item>> {
        self.read(|items| {
            items
                .get(index)
                .map(|v| Item::wrap(&self.root, child_path(&self.path, Segment::Index(index)), v))
        })
    }

    /// Copy of the element at `index`.
    pub fn get_value(&self, index: usize) -> Result<Option<Value>> {
        self.read(|items| items.get(index).cloned())
    }

    /// Element at `index` decoded as `T`.
    pub fn get_as<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>> {
        self.get_value(index)?.map(decode).transpose()
    }

    /// Handle onto the nested mapping at `index`.
    pub fn dict(&self, index: usize) -> Result<SyncedDict> {
        match self.get(index)? {
            Some(Item::Dict(d)) => Ok(d),
            Some(_) => Err(self
                .root
                .detached(&child_path(&self.path, Segment::Index(index)), Kind::Mapping)),
            None => Err(Error::IndexOutOfRange {
                index,
                len: self.len()?,
            }),
        }
    }

    /// Handle onto the nested sequence at `index`.
    pub fn list(&self, index: usize) -> Result<SyncedList> {
        match self.get(index)? {
            Some(Item::List(l)) => Ok(l),
            Some(_) => Err(self
                .root
                .detached(&child_path(&self.path, Segment::Index(index)), Kind::Sequence)),
            None => Err(Error::IndexOutOfRange {
                index,
                len: self.len()?,
            }),
        }
    }

    /// Number of elements.
    pub fn len(&self) -> Result<usize> {
        self.read(|items| items.len())
    }

    /// `true` when there are no elements.
    pub fn is_empty(&self) -> Result<bool> {
        self.read(|items| items.is_empty())
    }

    /// Snapshot of all elements.
    pub fn iter(&self) -> Result<Vec<Value>> {
        self.read(|items| items.clone())
    }

    /// Copy of the whole sequence.
    pub fn to_value(&self) -> Result<Value> {
        self.read(|items| Value::Array(items.clone()))
    }

    // ---- writes ----

    /// Replace the element at `index`, returning the old one.
    pub fn set(&self, index: usize, value: impl Serialize) -> Result<Value> {
        let value = self.candidate(value)?;
        self.mutate(|items| {
            let len = items.len();
            let slot = items
                .get_mut(index)
                .ok_or(Error::IndexOutOfRange { index, len })?;
            Ok(std::mem::replace(slot, value))
        })
    }

    /// Append to the end.
    #[doc(alias = "append")]
    pub fn push(&self, value: impl Serialize) -> Result<()> {
        let value = self.candidate(value)?;
        self.mutate(|items| {
            items.push(value);
            Ok(())
        })
    }

    /// Insert at `index`, shifting later elements right. `index == len`
    /// appends.
    pub fn insert(&self, index: usize, value: impl Serialize) -> Result<()> {
        let value = self.candidate(value)?;
        self.mutate(|items| {
            if index > items.len() {
                return Err(Error::IndexOutOfRange {
                    index,
                    len: items.len(),
                });
            }
            items.insert(index, value);
            Ok(())
        })
    }

    /// Remove and return the last element.
    pub fn pop(&self) -> Result<Option<Value>> {
        self.mutate(|items| Ok(items.pop()))
    }

    /// Remove and return the element at `index`.
    pub fn remove(&self, index: usize) -> Result<Value> {
        self.mutate(|items| {
            if index >= items.len() {
                return Err(Error::IndexOutOfRange {
                    index,
                    len: items.len(),
                });
            }
            Ok(items.remove(index))
        })
    }

    /// Append many elements with a single write. All are validated first.
    pub fn extend<I, V>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = V>,
        V: Serialize,
    {
        let batch = values
            .into_iter()
            .map(|v| self.candidate(v))
            .collect::<Result<Vec<_>>>()?;
        self.mutate(|items| {
            items.extend(batch);
            Ok(())
        })
    }

    /// Drop all elements.
    pub fn clear(&self) -> Result<()> {
        self.mutate(|items| {
            items.clear();
            Ok(())
        })
    }

    /// Replace the element at `index` with `f(current)` in one locked cycle.
    /// See [`SyncedDict::modify`].
    pub fn modify<F, V>(&self, index: usize, f: F) -> Result<Value>
    where
        F: FnOnce(&Value) -> V,
        V: Serialize,
    {
        let validators = self.root.validators();
        self.mutate(|items| {
            let len = items.len();
            let slot = items
                .get_mut(index)
                .ok_or(Error::IndexOutOfRange { index, len })?;
            let next = to_candidate(&f(&*slot))?;
            validators.validate(None, &next)?;
            *slot = next.clone();
            Ok(next)
        })
    }

    /// Replace the whole sequence.
    pub fn reset<I, V>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = V>,
        V: Serialize,
    {
        let batch = values
            .into_iter()
            .map(|v| self.candidate(v))
            .collect::<Result<Vec<_>>>()?;
        self.mutate(|items| {
            *items = batch;
            Ok(())
        })
    }

    // ---- persistence ----

    /// Re-read the document from the backend.
    pub fn load(&self) -> Result<()> {
        self.root.load()
    }

    /// Write the whole document now. Nested handles save their root.
    pub fn save(&self) -> Result<()> {
        self.root.save()
    }

    /// Throw away unsaved changes by reloading from the backend.
    pub fn discard(&self) -> Result<()> {
        self.root.discard()
    }
}

impl PartialEq<Value> for SyncedList {
    fn eq(&self, other: &Value) -> bool {
        self.to_value().map_or(false, |v| &v == other)
    }
}

impl PartialEq for SyncedList {
    fn eq(&self, other: &Self) -> bool {
        match (self.to_value(), other.to_value()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for SyncedList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedList")
            .field("resource", &self.resource())
            .field("location", &self.location())
            .finish_non_exhaustive()
    }
}
