//! Content digests used to spot unchanged writes and external edits.

use sha2::{Digest as _, Sha256};
use std::fmt;

/// SHA-256 of a serialized document.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Hash `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Twelve hex chars is plenty to tell digests apart in logs.
        let full = self.to_string();
        write!(f, "Digest({})", &full[..12])
    }
}

/// What the backend held the last time a root read or wrote it.
///
/// `raw` hashes the bytes exactly as stored, `canonical` hashes them as this
/// crate would have serialized the decoded value. They differ when someone
/// else wrote the file with different formatting. `None` means the resource
/// did not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Observed {
    pub raw: Option<Digest>,
    pub canonical: Option<Digest>,
}

impl Observed {
    pub fn absent() -> Self {
        Self {
            raw: None,
            canonical: None,
        }
    }

    pub fn written(digest: Digest) -> Self {
        Self {
            raw: Some(digest),
            canonical: Some(digest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        assert_eq!(
            Digest::of(b"").to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn equal_bytes_equal_digest() {
        assert_eq!(Digest::of(br#"{"a":1}"#), Digest::of(br#"{"a":1}"#));
        assert_ne!(Digest::of(br#"{"a":1}"#), Digest::of(br#"{"a":2}"#));
    }

    #[test]
    fn debug_is_short() {
        let dbg = format!("{:?}", Digest::of(b"x"));
        assert_eq!(dbg.len(), "Digest()".len() + 12);
    }
}
