//! Validator chain run against every candidate before it enters a document.
//!
//! Validators are pure checks. A chain runs them in order and stops at the
//! first refusal; the tree is only touched after the whole chain passes.

use crate::error::ValidationError;
use crate::serializer::{JsonSerializer, Serializer};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Nesting limit for a whole JSON document, the root container included.
/// serde_json refuses to decode documents nested deeper than 128 levels.
pub const MAX_JSON_DEPTH: usize = 100;

/// Mapping key in canonical string form.
///
/// Strings are taken as-is, integers and booleans are rendered the way JSON
/// renders them (`1`, `-7`, `true`), so `1` and `"1"` address the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(String);

impl Key {
    /// Canonical form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Take the canonical string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.to_owned())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key(s)
    }
}

impl From<&String> for Key {
    fn from(s: &String) -> Self {
        Key(s.clone())
    }
}

impl From<bool> for Key {
    fn from(b: bool) -> Self {
        Key(b.to_string())
    }
}

macro_rules! int_keys {
    ($($t:ty),*) => {
        $(impl From<$t> for Key {
            fn from(n: $t) -> Self {
                Key(n.to_string())
            }
        })*
    };
}

int_keys!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

/// One check in a [`ValidatorChain`].
///
/// `key` is set when the value is about to be stored under a mapping key,
/// and is `None` for sequence elements and whole documents. Nested mapping
/// keys inside `value` are the validator's to inspect; [`for_each_key`]
/// walks them.
pub trait Validator: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Accept or refuse the candidate.
    fn validate(&self, key: Option<&str>, value: &Value) -> Result<(), ValidationError>;
}

/// Ordered list of validators.
pub struct ValidatorChain {
    validators: Vec<Box<dyn Validator>>,
}

impl ValidatorChain {
    /// A chain that accepts everything.
    pub fn empty() -> Self {
        Self {
            validators: Vec::new(),
        }
    }

    /// [`JsonFormat`] followed by [`RoundTrip`]: what the JSON backend can
    /// store faithfully.
    pub fn json() -> Self {
        Self::empty().with(JsonFormat).with(RoundTrip::json())
    }

    /// Append a validator; it runs after the ones already present.
    #[must_use]
    pub fn with(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    /// Append a validator in place.
    pub fn push(&mut self, validator: Box<dyn Validator>) {
        self.validators.push(validator);
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// `true` when nothing will be checked.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Run every validator in order; first refusal wins.
    pub fn validate(&self, key: Option<&str>, value: &Value) -> Result<(), ValidationError> {
        for v in &self.validators {
            if let Err(e) = v.validate(key, value) {
                tracing::debug!(validator = v.name(), error = %e, "candidate rejected");
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Default for ValidatorChain {
    fn default() -> Self {
        Self::json()
    }
}

impl fmt::Debug for ValidatorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.validators.iter().map(|v| v.name()))
            .finish()
    }
}

/// Convert anything serde can serialize into a candidate document value.
///
/// Maps whose keys aren't strings or integers, and types serde_json can't
/// represent, are refused here.
pub fn to_candidate<T: Serialize + ?Sized>(value: &T) -> Result<Value, ValidationError> {
    serde_json::to_value(value).map_err(|e| ValidationError::UnsupportedValue(e.to_string()))
}

/// Visit `key` (if any) and every mapping key nested inside `value`.
pub fn for_each_key<F>(key: Option<&str>, value: &Value, f: &mut F) -> Result<(), ValidationError>
where
    F: FnMut(&str) -> Result<(), ValidationError>,
{
    if let Some(k) = key {
        f(k)?;
    }
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                for_each_key(Some(k), v, f)?;
            }
        }
        Value::Array(items) => {
            for v in items {
                for_each_key(None, v, f)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Container nesting depth; scalars are 0.
pub fn depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
        _ => 0,
    }
}

/// Refuses values nested deeper than [`MAX_JSON_DEPTH`].
///
/// Documents run their chain over the whole tree after every change, so the
/// limit holds for the document however deep the handle that wrote it.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

impl Validator for JsonFormat {
    fn name(&self) -> &str {
        "json_format"
    }

    fn validate(&self, _key: Option<&str>, value: &Value) -> Result<(), ValidationError> {
        let d = depth(value);
        if d > MAX_JSON_DEPTH {
            return Err(ValidationError::UnsupportedValue(format!(
                "nested {d} levels deep, limit is {MAX_JSON_DEPTH}"
            )));
        }
        Ok(())
    }
}

/// Refuses values that decode to something else after encoding.
///
/// Catches floats the decoder can't reproduce bit-for-bit.
pub struct RoundTrip {
    serializer: Box<dyn Serializer>,
}

impl RoundTrip {
    /// Round trip through compact JSON.
    pub fn json() -> Self {
        Self::with_serializer(JsonSerializer::new())
    }

    /// Round trip through a custom codec.
    pub fn with_serializer(serializer: impl Serializer + 'static) -> Self {
        Self {
            serializer: Box::new(serializer),
        }
    }
}

impl Validator for RoundTrip {
    fn name(&self) -> &str {
        "round_trip"
    }

    fn validate(&self, _key: Option<&str>, value: &Value) -> Result<(), ValidationError> {
        if !has_float(value) {
            return Ok(());
        }
        let bytes = self
            .serializer
            .serialize(value)
            .map_err(|e| ValidationError::RoundTrip(e.to_string()))?;
        let back = self
            .serializer
            .deserialize(&bytes)
            .map_err(|e| ValidationError::RoundTrip(e.to_string()))?;
        if &back != value {
            return Err(ValidationError::RoundTrip(format!(
                "encoded as {}",
                String::from_utf8_lossy(&bytes)
            )));
        }
        Ok(())
    }
}

// Integers and strings always survive serde_json; only floats can drift.
fn has_float(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.is_f64(),
        Value::Object(map) => map.values().any(has_float),
        Value::Array(items) => items.iter().any(has_float),
        _ => false,
    }
}

/// Refuses mapping keys containing `.`, so keys can double as dotted paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDotInKey;

impl Validator for NoDotInKey {
    fn name(&self) -> &str {
        "no_dot_in_key"
    }

    fn validate(&self, key: Option<&str>, value: &Value) -> Result<(), ValidationError> {
        for_each_key(key, value, &mut |k| {
            if k.contains('.') {
                Err(ValidationError::InvalidKey {
                    key: k.to_owned(),
                    reason: "mapping keys may not contain dots".into(),
                })
            } else {
                Ok(())
            }
        })
    }
}

/// Refuses values nested deeper than a custom limit. Like [`JsonFormat`],
/// it bounds whole documents, where the root counts as one level.
#[derive(Debug, Clone, Copy)]
pub struct MaxDepth(pub usize);

impl Validator for MaxDepth {
    fn name(&self) -> &str {
        "max_depth"
    }

    fn validate(&self, _key: Option<&str>, value: &Value) -> Result<(), ValidationError> {
        let d = depth(value);
        if d > self.0 {
            return Err(ValidationError::UnsupportedValue(format!(
                "nested {d} levels deep, limit is {}",
                self.0
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn keys_are_canonicalised() {
        assert_eq!(Key::from(42u8).as_str(), "42");
        assert_eq!(Key::from(-7i64).as_str(), "-7");
        assert_eq!(Key::from(true).as_str(), "true");
        assert_eq!(Key::from("x"), Key::from(String::from("x")));
    }

    #[test]
    fn depth_counts_containers() {
        assert_eq!(depth(&json!(1)), 0);
        assert_eq!(depth(&json!([])), 1);
        assert_eq!(depth(&json!({"a": [{"b": 1}]})), 3);
    }

    #[test]
    fn json_chain_rejects_deep_nesting() {
        let mut v = json!(0);
        for _ in 0..=MAX_JSON_DEPTH {
            v = json!([v]);
        }
        let err = ValidatorChain::json().validate(None, &v).unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedValue(_)));
    }

    #[test]
    fn json_chain_accepts_ordinary_values() {
        let chain = ValidatorChain::json();
        chain
            .validate(Some("k"), &json!({"a": [1, 2.5, "s", null, false]}))
            .unwrap();
        chain.validate(None, &json!(0.1)).unwrap();
    }

    #[test]
    fn dotted_keys_rejected_at_any_depth() {
        let chain = ValidatorChain::empty().with(NoDotInKey);
        assert!(chain.validate(Some("a.b"), &json!(1)).is_err());
        assert!(chain.validate(Some("a"), &json!({"x": {"y.z": 1}})).is_err());
        assert!(chain.validate(None, &json!([{"p.q": 1}])).is_err());
        chain.validate(Some("a"), &json!({"x": {"y": 1}})).unwrap();
    }

    #[test]
    fn tuple_keyed_maps_are_unsupported() {
        let mut m = HashMap::new();
        m.insert((1, 2), "pair");
        assert!(matches!(
            to_candidate(&m),
            Err(ValidationError::UnsupportedValue(_))
        ));
    }

    #[test]
    fn integer_keyed_maps_become_string_keys() {
        let mut m = HashMap::new();
        m.insert(3, "three");
        assert_eq!(to_candidate(&m).unwrap(), json!({"3": "three"}));
    }

    #[test]
    fn custom_max_depth() {
        let chain = ValidatorChain::empty().with(MaxDepth(1));
        chain.validate(None, &json!([1, 2])).unwrap();
        assert!(chain.validate(None, &json!([[1]])).is_err());
    }

    #[test]
    fn chain_debug_lists_names() {
        let dbg = format!("{:?}", ValidatorChain::json().with(NoDotInKey));
        assert_eq!(dbg, r#"["json_format", "round_trip", "no_dot_in_key"]"#);
    }
}
