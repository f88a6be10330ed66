//! Structural values and the equality engine.
//!
//! Task parameters, task results and store items are all [`Value`]s. Lists
//! and records are reference counted and immutable, which makes cloning cheap
//! and gives the equality engine a pointer identity to work with.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32};

/// Atomic reference-counted string type used for field names and strings.
pub(crate) type ArcStr = Arc<str>;

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

/// Opt-in identity marker carried by a record.
///
/// Two records carrying the same marker are equal no matter what their fields
/// contain. Any other pair of records, marked or not, compares key-wise.
/// Markers survive [`Value::extend`], so a record derived from another one by
/// a shallow extend still compares equal to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity(u64);

impl Identity {
    fn fresh() -> Self {
        Identity(NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
pub struct Record {
    identity: Option<Identity>,
    fields: BTreeMap<ArcStr, Value>,
}

impl Record {
    pub fn identity(&self) -> Option<Identity> {
        self.identity
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(key, value)| (key.as_ref(), value))
    }
}

/// A structural value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(ArcStr),
    List(Arc<[Value]>),
    Record(Arc<Record>),
}

impl Value {
    /// Builds a record from key/value pairs.
    pub fn record<K, I>(fields: I) -> Self
    where
        K: Into<ArcStr>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Record(Arc::new(Record {
            identity: None,
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }))
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(items.into_iter().collect())
    }

    /// Returns this record stamped with a fresh identity marker. Values that
    /// are not records are returned unchanged.
    pub fn identified(self) -> Self {
        match self {
            Value::Record(record) => Value::Record(Arc::new(Record {
                identity: Some(Identity::fresh()),
                fields: record.fields.clone(),
            })),
            other => other,
        }
    }

    /// Shallow extend: a new record holding this record's fields overwritten
    /// by `fields`. The identity marker, if any, is carried over.
    ///
    /// Extending a non-record starts from an empty record.
    pub fn extend<K, I>(&self, fields: I) -> Self
    where
        K: Into<ArcStr>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let (identity, mut merged) = match self {
            Value::Record(record) => (record.identity, record.fields.clone()),
            _ => (None, BTreeMap::new()),
        };

        for (key, value) in fields {
            merged.insert(key.into(), value);
        }

        Value::Record(Arc::new(Record {
            identity,
            fields: merged,
        }))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null, booleans, numbers and strings.
    pub fn is_primitive(&self) -> bool {
        !matches!(self, Value::List(_) | Value::Record(_))
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Field lookup on records; `None` for everything else.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_record().and_then(|record| record.get(key))
    }

    /// Number of strong references to the shared allocation backing this
    /// value, `None` for primitives.
    pub(crate) fn ref_count(&self) -> Option<usize> {
        match self {
            Value::List(list) => Some(Arc::strong_count(list)),
            Value::Record(record) => Some(Arc::strong_count(record)),
            _ => None,
        }
    }

    /// True if both values share one allocation.
    pub(crate) fn same_allocation(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Record(a), Value::Record(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Structural fingerprint, markers ignored. Values equal without the
    /// help of a marker share it.
    pub fn fingerprint(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::default();
        self.digest(&mut hasher, true);
        hasher.into()
    }

    /// True if some record in this value carries an identity marker.
    pub(crate) fn is_marked(&self) -> bool {
        match self {
            Value::List(list) => list.iter().any(Value::is_marked),
            Value::Record(record) => {
                record.identity.is_some() || record.fields.values().any(Value::is_marked)
            }
            _ => false,
        }
    }

    /// Records contribute their fields only when `deep`, since a shared
    /// marker makes records equal whatever their fields hold.
    fn digest<H: Hasher>(&self, state: &mut H, deep: bool) {
        match self {
            Value::Null => state.write_u8(0),
            Value::Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            Value::Number(n) => {
                state.write_u8(2);
                state.write_u64(canonical_bits(*n));
            }
            Value::String(s) => {
                state.write_u8(3);
                s.hash(state);
            }
            Value::List(list) => {
                state.write_u8(4);
                state.write_usize(list.len());
                for item in list.iter() {
                    item.digest(state, deep);
                }
            }
            Value::Record(record) => {
                state.write_u8(5);
                if deep {
                    state.write_usize(record.fields.len());
                    for (key, value) in &record.fields {
                        key.hash(state);
                        value.digest(state, deep);
                    }
                }
            }
        }
    }

    /// True if every field of `self` is present and equal in `other`. Both
    /// must be records; null is the empty record.
    pub fn is_subset_of(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, _) => true,
            (Value::Record(small), Value::Record(big)) => small
                .fields
                .iter()
                .all(|(key, value)| big.fields.get(key).is_some_and(|v| equal(value, v))),
            _ => false,
        }
    }
}

fn address<T: ?Sized>(ptr: &Arc<T>) -> usize {
    Arc::as_ptr(ptr) as *const () as usize
}

/// Structural (deep) equality.
///
/// Numbers compare by value with `NaN == NaN`. Lists compare element-wise
/// after a length check, records key-wise after a key-count check. Records
/// carrying the same identity marker are equal without looking at their fields.
pub fn equal(a: &Value, b: &Value) -> bool {
    Comparison::default().equal(a, b)
}

#[derive(Default)]
struct Comparison {
    /// Pairs of allocations currently being compared.
    in_progress: HashSet<(usize, usize)>,
}

impl Comparison {
    fn equal(&mut self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                if a.len() != b.len() {
                    return false;
                }

                let pair = (address(a), address(b));
                if !self.in_progress.insert(pair) {
                    return false;
                }
                let result = a.iter().zip(b.iter()).all(|(x, y)| self.equal(x, y));
                self.in_progress.remove(&pair);
                result
            }
            (Value::Record(a), Value::Record(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                if let (Some(x), Some(y)) = (a.identity, b.identity)
                    && x == y
                {
                    return true;
                }
                if a.fields.len() != b.fields.len() {
                    return false;
                }

                let pair = (address(a), address(b));
                if !self.in_progress.insert(pair) {
                    return false;
                }
                let result = a.fields.iter().all(|(key, x)| match b.fields.get(key) {
                    Some(y) => self.equal(x, y),
                    None => false,
                });
                self.in_progress.remove(&pair);
                result
            }
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        equal(self, other)
    }
}

// NaN equals NaN, so equality stays reflexive.
impl Eq for Value {}

/// Bit pattern used for hashing numbers, consistent with [`equal`].
pub(crate) fn canonical_bits(n: f64) -> u64 {
    if n.is_nan() {
        f64::NAN.to_bits()
    } else if n == 0.0 {
        0.0f64.to_bits()
    } else {
        n.to_bits()
    }
}

// Records hash by kind only, see `Value::digest`.
impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest(state, false);
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.into()),
            serde_json::Value::Array(items) => Value::list(items.into_iter().map(Value::from)),
            serde_json::Value::Object(map) => {
                Value::record(map.into_iter().map(|(k, v)| (k, Value::from(v))))
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.to_string()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            Value::Record(record) => serde_json::Value::Object(
                record
                    .fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_json::Value::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) if n.is_nan() => write!(f, "NaN"),
            other => write!(f, "{}", serde_json::Value::from(other)),
        }
    }
}
