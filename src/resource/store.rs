use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::value::Value;

/// Item storage shared by the tasks of one resource.
///
/// Implementations decide how items are identified. Every method takes
/// `&self`, stores are shared between tasks that may run concurrently.
pub trait Store: Send + Sync {
    /// The identifier carried by `item`, if it carries one.
    fn identify(&self, item: &Value) -> Option<Value>;

    fn select(&self, id: &Value) -> Option<Value>;

    fn select_all(&self, ids: &[Value]) -> Vec<Value> {
        ids.iter().filter_map(|id| self.select(id)).collect()
    }

    fn upsert(&self, items: &[Value]);

    fn remove(&self, ids: &[Value]);
}

/// In-memory [`Store`] keyed by one field of each record.
pub struct MemoryStore {
    key: Arc<str>,
    items: Mutex<HashMap<Value, Value>>,
}

impl MemoryStore {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self {
            key: key.into(),
            items: Mutex::default(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("id")
    }
}

impl Store for MemoryStore {
    fn identify(&self, item: &Value) -> Option<Value> {
        item.get(&self.key).filter(|id| !id.is_null()).cloned()
    }

    fn select(&self, id: &Value) -> Option<Value> {
        self.items.lock().unwrap().get(id).cloned()
    }

    fn upsert(&self, items: &[Value]) {
        let mut map = self.items.lock().unwrap();
        for item in items {
            match self.identify(item) {
                Some(id) => {
                    map.insert(id, item.clone());
                }
                None => tracing::trace!("skipping item without '{}': {item}", self.key),
            }
        }
    }

    fn remove(&self, ids: &[Value]) {
        let mut map = self.items.lock().unwrap();
        for id in ids {
            map.remove(id);
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("key", &self.key)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_upsert_select_remove() {
        let store = MemoryStore::default();
        store.upsert(&[
            json!({"id": 1, "title": "a"}).into(),
            json!({"id": 2, "title": "b"}).into(),
            json!({"title": "no id"}).into(),
        ]);
        assert_eq!(store.len(), 2);

        store.upsert(&[json!({"id": 1, "title": "c"}).into()]);
        assert_eq!(
            store.select(&Value::from(1i64)),
            Some(json!({"id": 1, "title": "c"}).into())
        );

        let found = store.select_all(&[Value::from(2i64), Value::from(3i64)]);
        assert_eq!(found.len(), 1);

        store.remove(&[Value::from(1i64)]);
        assert!(store.select(&Value::from(1i64)).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_custom_key() {
        let store = MemoryStore::new("slug");
        let item: Value = json!({"slug": "hello", "id": 7}).into();
        assert_eq!(store.identify(&item), Some(Value::from("hello")));
        assert_eq!(store.identify(&Value::from("hello")), None);
    }
}
