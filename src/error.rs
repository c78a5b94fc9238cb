//! Unified error type for all collection, backend, and buffering operations.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Things that can go wrong when using a synced collection.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Reading or writing the resource failed, or it does not exist. Retryable.
    #[error("backend error on {resource}: {message}")]
    Backend {
        /// Resource the operation targeted.
        resource: String,
        /// What the backend reported.
        message: String,
    },
    /// A key or value was rejected. Nothing was applied.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The resource lock was not acquired in time. Retryable.
    #[error("timed out after {timeout:?} waiting for the lock on {resource}")]
    LockTimeout {
        /// Resource whose lock was contended.
        resource: String,
        /// Bound that expired.
        timeout: Duration,
    },
    /// The resource changed on the backend since it was last read or written.
    #[error("{resource} was modified externally since it was last synced")]
    Conflict {
        /// Resource that diverged.
        resource: String,
    },
    /// Stored content could not be decoded into a collection.
    #[error("corrupt resource {resource}: {message}")]
    Corruption {
        /// Resource holding the bad content.
        resource: String,
        /// Decoder message.
        message: String,
    },
    /// One or more resources failed during a multi-resource flush.
    #[error(transparent)]
    Flush(#[from] FlushError),
    /// A nested handle no longer points at a container of its kind.
    #[error("{resource}: no {expected} at {path}")]
    Detached {
        /// Resource the handle belongs to.
        resource: String,
        /// Rendered path of the handle.
        path: String,
        /// `"mapping"` or `"sequence"`.
        expected: &'static str,
    },
    /// Mapping key not present.
    #[error("key not found: {0}")]
    KeyNotFound(String),
    /// Sequence index past the end.
    #[error("index {index} out of range for sequence of length {len}")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Current length.
        len: usize,
    },
    /// A stored value is not of the type a typed read asked for.
    #[error("value does not decode as the requested type: {0}")]
    Decode(String),
    /// Bad configuration or misuse of the buffering API.
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for a [`Error::Backend`] on `resource`.
    pub fn backend(resource: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Backend {
            resource: resource.into(),
            message: message.to_string(),
        }
    }

    /// Shorthand for a [`Error::Corruption`] on `resource`.
    pub fn corruption(resource: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Corruption {
            resource: resource.into(),
            message: message.to_string(),
        }
    }

    /// `true` for failures a caller may reasonably retry as-is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Backend { .. } | Error::LockTimeout { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Error::backend("<io>", err)
        } else if err.is_syntax() || err.is_eof() {
            Error::corruption("<input>", err)
        } else {
            Error::Validation(ValidationError::UnsupportedValue(err.to_string()))
        }
    }
}

/// Why a candidate key or value was refused.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The key has a shape the chain does not allow.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey {
        /// Offending key in canonical form.
        key: String,
        /// Which rule it broke.
        reason: String,
    },
    /// The value can't be represented in the document.
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),
    /// Encoding then decoding the value gives something different.
    #[error("value does not survive a round trip: {0}")]
    RoundTrip(String),
}

/// Per-resource failures collected during one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushError {
    failures: Vec<(String, Error)>,
}

impl FlushError {
    pub(crate) fn new(failures: Vec<(String, Error)>) -> Self {
        Self { failures }
    }

    /// Every failed resource with the error it hit, in flush order.
    #[must_use]
    pub fn failures(&self) -> &[(String, Error)] {
        &self.failures
    }

    /// Just the resource identifiers that failed.
    #[must_use]
    pub fn failed_resources(&self) -> Vec<&str> {
        self.failures.iter().map(|(r, _)| r.as_str()).collect()
    }
}

impl fmt::Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flush failed for {} resource(s)", self.failures.len())?;
        for (resource, err) in &self.failures {
            write!(f, "; {resource}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FlushError {}

/// Result alias using our [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
