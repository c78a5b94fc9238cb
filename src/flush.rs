//! Buffering modes and the policies that govern a flush.

/// Controls when mutations reach the backend.
///
/// Outside a buffered scope every document behaves as [`Unbuffered`]; the
/// other modes only take effect while a scope is open.
///
/// [`Unbuffered`]: BufferMode::Unbuffered
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferMode {
    /// Every mutation is a locked read-modify-write. Safest, most I/O.
    Unbuffered,
    /// Mutations stay in memory until the scope flushes. Nothing is
    /// serialized before that, and nothing survives a crash before that.
    #[default]
    Memory,
    /// Each mutation re-serializes the document into the scope's buffer, so
    /// buffer size is known; the flush still writes each document once.
    /// Going over capacity flushes everything early.
    File,
    /// [`File`](BufferMode::File), plus a flush skips documents whose bytes
    /// hash the same as what the backend already holds.
    SerializedFile,
}

impl BufferMode {
    /// `true` for modes that defer writes.
    pub fn is_buffered(self) -> bool {
        !matches!(self, BufferMode::Unbuffered)
    }

    /// `true` for modes that serialize into the byte buffer on every mutation.
    pub fn serializes_eagerly(self) -> bool {
        matches!(self, BufferMode::File | BufferMode::SerializedFile)
    }

    /// `true` when unchanged content is detected by digest and not written.
    pub fn skips_unchanged(self) -> bool {
        matches!(self, BufferMode::SerializedFile)
    }
}

/// What a flush does when the backend changed underneath it.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Don't look; the flush overwrites whatever is there.
    #[default]
    LastWriterWins,
    /// Re-read under the lock and fail with [`Error::Conflict`] if the
    /// content differs from what this process last read or wrote.
    ///
    /// [`Error::Conflict`]: crate::Error::Conflict
    Detect,
}

/// What leaving a scope through an error does to pending changes.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitPolicy {
    /// Flush whatever the scope managed to change.
    #[default]
    FlushAlways,
    /// Reload pending documents from the backend, dropping their changes.
    DiscardOnError,
}

/// Outcome of committing one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// Bytes went to the backend.
    Written,
    /// Content matched the last known digest; no write.
    Unchanged,
    /// Nothing was dirty.
    Clean,
}
