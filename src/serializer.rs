//! Serialization layer. Defaults to JSON via serde_json.
//!
//! Implement [`Serializer`] if a backend stores a different format. The trait
//! is object-safe so a backend can hand out `&dyn Serializer`.

use crate::error::{Error, Result};
use serde_json::Value;

/// Converts whole documents to/from bytes for persistence.
///
/// Both directions must be deterministic: the same value always encodes to
/// the same bytes, otherwise digest comparison reports phantom changes.
pub trait Serializer: Send + Sync {
    /// Encode a document to bytes.
    fn serialize(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode bytes back into a document.
    fn deserialize(&self, bytes: &[u8]) -> Result<Value>;
}

/// JSON serializer with optional pretty-printing.
///
/// Object keys come out sorted (serde_json's default map is ordered), which
/// is what makes the output deterministic.
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer {
    pretty: bool,
}

impl JsonSerializer {
    /// Compact JSON (single line, no extra whitespace).
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretty-printed JSON with indentation, easier to read by hand.
    pub fn pretty() -> Self {
        Self { pretty: true }
    }

    /// Whether this serializer indents its output.
    pub fn is_pretty(&self) -> bool {
        self.pretty
    }
}

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        };
        bytes.map_err(Error::from)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(Error::from)
    }
}
