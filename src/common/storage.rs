//! Local key/value store with lazy expiry.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::{Id, StoredValue, Value};

/// Default time to live of values stored by other nodes: one week.
pub const DEFAULT_STORAGE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "StorageRepr", into = "StorageRepr")]
/// Values this node holds on behalf of the network.
///
/// Outdated values are only dropped when they are looked at.
pub struct Storage {
    values: HashMap<Id, StoredValue>,
    ttl: Option<Duration>,
}

impl Storage {
    /// Create a new storage where values expire after `ttl`, or never if `None`.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            values: HashMap::new(),
            ttl,
        }
    }

    // === Getters ===

    /// The time to live given to values by [Storage::set].
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    // === Public Methods ===

    /// Get the value stored under `key`, dropping it if it is outdated.
    pub fn get(&mut self, key: &Id) -> Option<&Value> {
        if self.values.get(key).is_some_and(|v| v.outdated()) {
            self.values.remove(key);
        }

        self.values.get(key).map(|v| &v.value)
    }

    /// Store a value with the default time to live.
    pub fn set(&mut self, key: Id, value: Value) {
        self.set_with_ttl(key, value, self.ttl)
    }

    /// Store a value with an explicit time to live, `None` never expires.
    pub fn set_with_ttl(&mut self, key: Id, value: Value, ttl: Option<Duration>) {
        self.values.insert(key, StoredValue::new(value, ttl));
    }

    pub fn contains(&mut self, key: &Id) -> bool {
        self.get(key).is_some()
    }

    /// Restart the clock on `key` with a new time to live.
    pub fn expire(&mut self, key: &Id, ttl: Option<Duration>) {
        if let Some(stored) = self.values.get_mut(key) {
            *stored = StoredValue::new(stored.value.clone(), ttl);
        }
    }

    /// Drop all outdated values.
    pub fn cull(&mut self) {
        self.values.retain(|_, v| !v.outdated());
    }

    /// All live key/value pairs.
    pub fn iter(&mut self) -> impl Iterator<Item = (&Id, &Value)> {
        self.cull();

        self.values.iter().map(|(k, v)| (k, &v.value))
    }

    /// Live key/value pairs stored at least `age` ago.
    pub fn iter_older_than(&mut self, age: Duration) -> Vec<(Id, Value)> {
        self.cull();

        self.values
            .iter()
            .filter(|(_, v)| v.age() >= age)
            .map(|(k, v)| (*k, v.value.clone()))
            .collect()
    }

    pub fn keys(&mut self) -> Vec<Id> {
        self.iter().map(|(k, _)| *k).collect()
    }

    /// Number of values, including outdated ones not yet culled.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new(Some(DEFAULT_STORAGE_TTL))
    }
}

#[derive(Serialize, Deserialize)]
struct StorageRepr {
    #[serde(default)]
    ttl: Option<Duration>,
    values: Vec<(Id, StoredValue)>,
}

impl From<StorageRepr> for Storage {
    fn from(repr: StorageRepr) -> Self {
        Self {
            values: repr.values.into_iter().collect(),
            ttl: repr.ttl,
        }
    }
}

impl From<Storage> for StorageRepr {
    fn from(storage: Storage) -> Self {
        Self {
            ttl: storage.ttl,
            values: storage.values.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    #[test]
    fn set_get() {
        let mut storage = Storage::default();
        let key = Id::digest("alpha");

        assert!(storage.get(&key).is_none());

        storage.set(key, "beta".into());

        assert_eq!(storage.get(&key), Some(&Value::from("beta")));
        assert!(storage.contains(&key));
    }

    #[test]
    fn overwrite() {
        let mut storage = Storage::default();
        let key = Id::random();

        storage.set(key, 1.into());
        storage.set(key, 2.into());

        assert_eq!(storage.get(&key), Some(&Value::Int(2)));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn lazy_expiry() {
        let mut storage = Storage::new(Some(Duration::ZERO));
        let key = Id::random();

        storage.set(key, "short lived".into());
        thread::sleep(Duration::from_millis(5));

        assert_eq!(storage.len(), 1);
        assert!(storage.get(&key).is_none());
        assert!(storage.is_empty());
    }

    #[test]
    fn iter_culls() {
        let mut storage = Storage::default();
        let live = Id::random();
        let dead = Id::random();

        storage.set(live, 1.into());
        storage.set_with_ttl(dead, 2.into(), Some(Duration::ZERO));
        thread::sleep(Duration::from_millis(5));

        let keys = storage.keys();

        assert_eq!(keys, vec![live]);
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn expire_rearms() {
        let mut storage = Storage::default();
        let key = Id::random();

        storage.set(key, 1.into());
        storage.expire(&key, Some(Duration::ZERO));
        thread::sleep(Duration::from_millis(5));

        assert!(!storage.contains(&key));
    }

    #[test]
    fn older_than() {
        let mut storage = Storage::default();
        let old = Id::random();

        storage.set(old, 1.into());
        thread::sleep(Duration::from_millis(20));

        let young = Id::random();
        storage.set(young, 2.into());

        let older = storage.iter_older_than(Duration::from_millis(15));

        assert_eq!(older, vec![(old, Value::Int(1))]);
        assert_eq!(storage.iter_older_than(Duration::ZERO).len(), 2);
    }

    #[test]
    fn bencode_snapshot() {
        let mut storage = Storage::new(None);
        let key = Id::random();
        storage.set(key, "beta".into());

        let bytes = serde_bencode::to_bytes(&storage).unwrap();
        let mut decoded: Storage = serde_bencode::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.ttl(), None);
        assert_eq!(decoded.get(&key), Some(&Value::from("beta")));
    }
}
