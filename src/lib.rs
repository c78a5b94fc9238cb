//! File-backed synchronized JSON documents.
//!
//! Open a JSON object or array through a [`Registry`] and use it like an
//! ordinary collection; every change is mirrored to the backing file. Nested
//! objects and arrays come back as live handles that write through their
//! document. How often the backend is touched is up to you:
//!
//! - outside a buffered scope, every mutation is an immediate read-modify-write
//!   under the file's advisory lock, so concurrent processes don't lose
//!   each other's updates;
//! - inside a scope ([`Registry::buffered`], [`Registry::with_buffer`]),
//!   mutations stay in memory and the outermost scope writes each changed
//!   document once, optionally skipping documents whose bytes didn't change.
//!
//! ```rust,no_run
//! use synced_json::Registry;
//!
//! let registry = Registry::new();
//! let doc = registry.open_dict("job.json")?;
//! doc.set("a", 1)?;
//! doc.set("b", serde_json::json!({"c": 2}))?;
//! let b = doc.dict("b")?;
//! assert_eq!(b.get_as::<i64>("c")?, Some(2));
//! b.set("c", 3)?; // rewrites job.json
//! # Ok::<(), synced_json::Error>(())
//! ```
//!
//! Writes are atomic (temp file + rename). Durability is whatever the
//! filesystem gives rename and fsync; there are no multi-document
//! transactions.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod buffer;
pub mod collection;
pub mod digest;
pub mod error;
pub mod flush;
pub mod persist;
pub mod registry;
mod root;
pub mod serializer;
pub mod validate;

pub use backend::{Backend, FileBackend, LockGuard, MemoryBackend, MemoryStore};
pub use buffer::{BufferContext, BufferContextBuilder, BufferGuard};
pub use collection::{Item, SyncedDict, SyncedList};
pub use digest::Digest;
pub use error::{Error, FlushError, Result, ValidationError};
pub use flush::{BufferMode, Commit, ConflictPolicy, ExitPolicy};
pub use registry::{DocumentBuilder, Registry, DEFAULT_LOCK_TIMEOUT};
pub use serializer::{JsonSerializer, Serializer};
pub use validate::{
    JsonFormat, Key, MaxDepth, NoDotInKey, RoundTrip, Validator, ValidatorChain, MAX_JSON_DEPTH,
};
