//! Key/value cache with mutual lifetime retention.
//!
//! There is no tracing garbage collector to lean on, so the cache is an
//! explicit reference-counted arena. An entry for an object-like key (list or
//! record) stays alive while *either* the key or the value is referenced from
//! outside the cache. Liveness is read off the reference counts: the cache's
//! own copies do not count, and neither does the copy of the key a value
//! keeps for itself (see [`Ephemeral::retains`]). Dead entries are evicted by
//! a sweep that runs every `interval` insertions and before every iteration.
//!
//! Primitive keys live in an ordinary strong map and are never swept.

use std::collections::HashMap;
use std::sync::Arc;

use crate::value::{ArcStr, Value, canonical_bits, equal};

/// Values stored in an [`EphemeronCache`].
pub trait Ephemeral {
    /// True if the value keeps its own handle on the same allocation as `key`.
    fn retains(&self, _key: &Value) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PrimitiveKey {
    Null,
    Bool(bool),
    Number(u64),
    String(ArcStr),
}

impl PrimitiveKey {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(PrimitiveKey::Null),
            Value::Bool(b) => Some(PrimitiveKey::Bool(*b)),
            Value::Number(n) => Some(PrimitiveKey::Number(canonical_bits(*n))),
            Value::String(s) => Some(PrimitiveKey::String(s.clone())),
            Value::List(_) | Value::Record(_) => None,
        }
    }
}

struct Entry<V> {
    key: Value,
    value: Arc<V>,
}

impl<V: Ephemeral> Entry<V> {
    fn is_alive(&self) -> bool {
        let own = 1 + usize::from(self.value.retains(&self.key));
        let key_refs = self.key.ref_count().unwrap_or(usize::MAX);

        key_refs > own || Arc::strong_count(&self.value) > 1
    }
}

pub struct EphemeronCache<V> {
    /// Registry of object-like keys, scanned for lookups and iteration.
    objects: Vec<Entry<V>>,
    primitives: HashMap<PrimitiveKey, Entry<V>>,
    interval: usize,
    pending: usize,
}

impl<V: Ephemeral> EphemeronCache<V> {
    pub fn new(interval: usize) -> Self {
        Self {
            objects: Vec::new(),
            primitives: HashMap::new(),
            interval: interval.max(1),
            pending: 0,
        }
    }

    fn position(&self, key: &Value) -> Option<usize> {
        self.objects
            .iter()
            .position(|entry| entry.key.same_allocation(key))
            .or_else(|| {
                self.objects
                    .iter()
                    .position(|entry| equal(&entry.key, key))
            })
    }

    /// Looks up a structurally equal key.
    pub fn get(&self, key: &Value) -> Option<Arc<V>> {
        match PrimitiveKey::of(key) {
            Some(primitive) => self.primitives.get(&primitive).map(|e| e.value.clone()),
            None => self
                .position(key)
                .map(|index| self.objects[index].value.clone()),
        }
    }

    /// Inserts the pair, replacing any entry with a structurally equal key.
    pub fn set(&mut self, key: Value, value: Arc<V>) {
        self.delete(&key);

        match PrimitiveKey::of(&key) {
            Some(primitive) => {
                self.primitives.insert(primitive, Entry { key, value });
            }
            None => {
                self.objects.push(Entry { key, value });
                self.pending += 1;
                if self.pending >= self.interval {
                    self.sweep();
                }
            }
        }
    }

    pub fn delete(&mut self, key: &Value) -> Option<Arc<V>> {
        match PrimitiveKey::of(key) {
            Some(primitive) => self.primitives.remove(&primitive).map(|e| e.value),
            None => self
                .position(key)
                .map(|index| self.objects.swap_remove(index).value),
        }
    }

    /// Evicts object entries that nothing outside the cache refers to.
    /// Returns the number of evicted entries.
    pub fn sweep(&mut self) -> usize {
        let before = self.objects.len();
        self.objects.retain(Entry::is_alive);
        self.pending = 0;

        let evicted = before - self.objects.len();
        if evicted > 0 {
            tracing::trace!("ephemeron sweep evicted {evicted} entries");
        }
        evicted
    }

    /// All live entries, primitives first.
    pub fn iterate(&mut self) -> Vec<(Value, Arc<V>)> {
        self.sweep();

        self.primitives
            .values()
            .chain(self.objects.iter())
            .map(|entry| (entry.key.clone(), entry.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len() + self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Plain(u32);

    impl Ephemeral for Plain {}

    struct Holder(Value);

    impl Ephemeral for Holder {
        fn retains(&self, key: &Value) -> bool {
            self.0.same_allocation(key)
        }
    }

    #[test]
    fn test_structural_lookup() {
        let mut cache = EphemeronCache::new(64);
        let key: Value = json!({"id": 1}).into();
        let _value = Arc::new(Plain(1));
        cache.set(key.clone(), _value.clone());

        let found = cache.get(&json!({"id": 1}).into()).unwrap();
        assert_eq!(found.0, 1);
        assert!(cache.get(&json!({"id": 2}).into()).is_none());
    }

    #[test]
    fn test_set_replaces_equal_key() {
        let mut cache = EphemeronCache::new(64);
        let key: Value = json!({"id": 1}).into();
        cache.set(key.clone(), Arc::new(Plain(1)));
        cache.set(json!({"id": 1}).into(), Arc::new(Plain(2)));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key).unwrap().0, 2);
    }

    #[test]
    fn test_primitive_keys() {
        let mut cache = EphemeronCache::new(1);
        cache.set(Value::from("a"), Arc::new(Plain(1)));
        cache.set(Value::Number(f64::NAN), Arc::new(Plain(2)));

        // Primitives are held strongly and survive sweeps.
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.get(&Value::from("a")).unwrap().0, 1);
        assert_eq!(cache.get(&Value::Number(f64::NAN)).unwrap().0, 2);
        assert!(cache.delete(&Value::from("a")).is_some());
        assert!(cache.delete(&Value::from("a")).is_none());
    }

    #[test]
    fn test_alive_while_key_referenced() {
        let mut cache = EphemeronCache::new(64);
        let key: Value = json!({"id": 1}).into();
        cache.set(key.clone(), Arc::new(Plain(1)));

        assert_eq!(cache.sweep(), 0);
        drop(key);
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_alive_while_value_referenced() {
        let mut cache = EphemeronCache::new(64);
        let value = Arc::new(Plain(7));
        cache.set(json!({"id": 1}).into(), value.clone());

        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.get(&json!({"id": 1}).into()).unwrap().0, 7);
        drop(value);
        assert_eq!(cache.sweep(), 1);
    }

    #[test]
    fn test_mutual_retention() {
        let mut cache = EphemeronCache::new(64);
        let key: Value = json!({"id": 1}).into();
        let value = Arc::new(Holder(key.clone()));
        cache.set(key.clone(), value.clone());

        // The value's own copy of the key does not keep the pair alive.
        drop(value);
        assert_eq!(cache.sweep(), 0);
        drop(key);
        assert_eq!(cache.sweep(), 1);
    }

    #[test]
    fn test_iterate_prunes() {
        let mut cache = EphemeronCache::new(64);
        let kept: Value = json!({"id": 1}).into();
        cache.set(kept.clone(), Arc::new(Plain(1)));
        cache.set(json!({"id": 2}).into(), Arc::new(Plain(2)));

        let entries = cache.iterate();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, kept);
    }
}
