use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::value::{Value, equal};

/// A 32-byte BLAKE3 hash used as a content fingerprint.
///
/// In `sakiyomi` this keys the parameter scope interner: structurally equal
/// values hash to the same bucket, and the bucket is then confirmed with the
/// equality engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// Runtime configuration.
///
/// ```rust
/// # use sakiyomi::Config;
/// let config = Config::from_json(r#"{ "prerun_ttl": 60 }"#).unwrap();
/// assert_eq!(config.prerun_ttl.as_secs(), 60);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long a speculatively started task is kept alive without a consumer.
    /// Seconds when deserialized.
    #[serde(deserialize_with = "seconds")]
    pub prerun_ttl: Duration,
    /// Number of cache insertions between two ephemeron sweeps.
    pub sweep_interval: usize,
}

fn seconds<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    f64::deserialize(deserializer).map(Duration::from_secs_f64)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prerun_ttl: Duration::from_secs(5 * 60),
            sweep_interval: 64,
        }
    }
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn prerun_ttl(mut self, ttl: Duration) -> Self {
        self.prerun_ttl = ttl;
        self
    }

    pub fn sweep_interval(mut self, operations: usize) -> Self {
        self.sweep_interval = operations.max(1);
        self
    }
}

struct ScopeInner {
    hash: Hash32,
    value: Value,
}

/// Interned token standing for a structural parameter value.
///
/// Tokens obtained from the same [`Runtime`](crate::Runtime) for structurally
/// equal values are the same token, so comparing them is a pointer check.
#[derive(Clone)]
pub struct ParamScope(Arc<ScopeInner>);

impl ParamScope {
    pub fn value(&self) -> &Value {
        &self.0.value
    }

    /// Record-wise structural subset: every field of `self` appears with an
    /// equal value in `other`.
    pub fn is_subset_of(&self, other: &ParamScope) -> bool {
        self == other || self.0.value.is_subset_of(&other.0.value)
    }
}

impl PartialEq for ParamScope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ParamScope {}

impl std::fmt::Debug for ParamScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ParamScope({})", self.0.value)
    }
}

#[derive(Default)]
pub(crate) struct ScopeInterner {
    buckets: HashMap<Hash32, Vec<Weak<ScopeInner>>>,
}

impl ScopeInterner {
    /// Buckets are keyed by the markerless fingerprint. Records sharing a
    /// marker can differ in their fields, so a marked value that misses its
    /// bucket is looked up among every live scope.
    pub(crate) fn intern(&mut self, value: &Value) -> ParamScope {
        let hash = value.fingerprint();
        let bucket = self.buckets.entry(hash).or_default();
        bucket.retain(|weak| weak.strong_count() > 0);

        if let Some(inner) = find(bucket, value) {
            return ParamScope(inner);
        }
        if value.is_marked()
            && let Some(inner) = self.buckets.values().find_map(|bucket| find(bucket, value))
        {
            return ParamScope(inner);
        }

        let inner = Arc::new(ScopeInner {
            hash,
            value: value.clone(),
        });
        self.buckets.entry(hash).or_default().push(Arc::downgrade(&inner));
        tracing::trace!("interned scope {:?}", inner.hash);
        ParamScope(inner)
    }

    pub(crate) fn len(&mut self) -> usize {
        self.buckets.retain(|_, bucket| {
            bucket.retain(|weak| weak.strong_count() > 0);
            !bucket.is_empty()
        });
        self.buckets.values().map(Vec::len).sum()
    }
}

fn find(bucket: &[Weak<ScopeInner>], value: &Value) -> Option<Arc<ScopeInner>> {
    bucket
        .iter()
        .filter_map(Weak::upgrade)
        .find(|inner| equal(&inner.value, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_intern_dedup() {
        let mut interner = ScopeInterner::default();
        let a = interner.intern(&json!({"project": 1, "page": 2}).into());
        let b = interner.intern(&json!({"page": 2, "project": 1}).into());
        let c = interner.intern(&json!({"project": 2}).into());

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn test_intern_marked() {
        let mut interner = ScopeInterner::default();
        let marked = Value::from(json!({"project": 1})).identified();
        let a = interner.intern(&marked);

        let b = interner.intern(&json!({"project": 1}).into());
        assert_eq!(a, b);

        let c = interner.intern(&marked.extend([("page", Value::from(2i64))]));
        assert_eq!(a, c);
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn test_intern_prunes_dead() {
        let mut interner = ScopeInterner::default();
        drop(interner.intern(&json!({"project": 1}).into()));
        assert_eq!(interner.len(), 0);
    }

    #[test]
    fn test_scope_subset() {
        let mut interner = ScopeInterner::default();
        let small = interner.intern(&json!({"project": 1}).into());
        let big = interner.intern(&json!({"project": 1, "page": 2}).into());
        assert!(small.is_subset_of(&big));
        assert!(!big.is_subset_of(&small));
    }

    #[test]
    fn test_config() {
        let config = Config::from_json(r#"{ "sweep_interval": 8 }"#).unwrap();
        assert_eq!(config.sweep_interval, 8);
        assert_eq!(config.prerun_ttl, Duration::from_secs(300));
        assert!(Config::from_json("{ nope").is_err());
    }
}
