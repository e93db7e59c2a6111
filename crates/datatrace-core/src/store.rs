//! Correlation store - shared per-trace state
//!
//! Two key families share one store:
//! - `PARENT-<trace id>` -> connection id of the exchange that opened the trace
//! - `DATA-<trace id>` -> current serialized label set of the trace
//!
//! Every method is a single atomic step. Sequences of calls are not atomic:
//! creating the `PARENT-` and `DATA-` entries of a trace takes two steps, and
//! concurrent requests for the same trace id may interleave between them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::hash_map;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const PARENT_PREFIX: &str = "PARENT-";
const DATA_PREFIX: &str = "DATA-";

/// Key holding the parent connection id of a trace
pub fn parent_key(trace_id: &str) -> String {
    format!("{}{}", PARENT_PREFIX, trace_id)
}

/// Key holding the label payload of a trace
pub fn data_key(trace_id: &str) -> String {
    format!("{}{}", DATA_PREFIX, trace_id)
}

/// Recover the trace id from a `PARENT-` or `DATA-` key
pub fn trace_id_of(key: &str) -> Option<&str> {
    key.strip_prefix(PARENT_PREFIX)
        .or_else(|| key.strip_prefix(DATA_PREFIX))
}

/// Thread-safe string key/value store
pub trait CorrelationStore: Send + Sync {
    /// Current value of `key`, or `None` if absent
    fn get(&self, key: &str) -> Option<String>;

    /// Insert only if absent. Returns whether the value was inserted.
    fn create(&self, key: &str, value: &str) -> bool;

    /// Overwrite only if present. Returns whether the value was written.
    fn update(&self, key: &str, value: &str) -> bool;

    /// Insert or overwrite
    fn put(&self, key: &str, value: &str);

    /// Remove if present. Returns whether an entry was removed.
    fn delete(&self, key: &str) -> bool;

    /// Number of entries
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys whose entry was created at least `max_age` ago
    fn expired(&self, max_age: Duration) -> Vec<String>;

    /// Remove `key` only if its entry is still at least `max_age` old.
    /// Returns whether an entry was removed.
    fn delete_if_expired(&self, key: &str, max_age: Duration) -> bool;
}

#[derive(Debug, Clone)]
struct StoreEntry {
    value: String,
    created_at: Instant,
}

impl StoreEntry {
    fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
            created_at: Instant::now(),
        }
    }

    fn is_expired(&self, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(self.created_at) >= max_age
    }
}

/// Sharded concurrent store
///
/// `create` and `update` run under the shard lock of their key, so each is a
/// single compare-and-set step.
#[derive(Debug, Default)]
pub struct ConcurrentStore {
    entries: DashMap<String, StoreEntry>,
}

impl ConcurrentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CorrelationStore for ConcurrentStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    fn create(&self, key: &str, value: &str) -> bool {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(StoreEntry::new(value));
                true
            }
        }
    }

    fn update(&self, key: &str, value: &str) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.value = value.to_string();
                true
            }
            None => false,
        }
    }

    fn put(&self, key: &str, value: &str) {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => slot.get_mut().value = value.to_string(),
            Entry::Vacant(slot) => {
                slot.insert(StoreEntry::new(value));
            }
        }
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn expired(&self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.value().is_expired(now, max_age))
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn delete_if_expired(&self, key: &str, max_age: Duration) -> bool {
        let now = Instant::now();
        self.entries
            .remove_if(key, |_, entry| entry.is_expired(now, max_age))
            .is_some()
    }
}

/// Store guarded by a single lock over the whole map
#[derive(Debug, Default)]
pub struct LockedStore {
    entries: Mutex<HashMap<String, StoreEntry>>,
}

impl LockedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CorrelationStore for LockedStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).map(|entry| entry.value.clone())
    }

    fn create(&self, key: &str, value: &str) -> bool {
        match self.entries.lock().entry(key.to_string()) {
            hash_map::Entry::Occupied(_) => false,
            hash_map::Entry::Vacant(slot) => {
                slot.insert(StoreEntry::new(value));
                true
            }
        }
    }

    fn update(&self, key: &str, value: &str) -> bool {
        match self.entries.lock().get_mut(key) {
            Some(entry) => {
                entry.value = value.to_string();
                true
            }
            None => false,
        }
    }

    fn put(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .entry(key.to_string())
            .and_modify(|entry| entry.value = value.to_string())
            .or_insert_with(|| StoreEntry::new(value));
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn expired(&self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.is_expired(now, max_age))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn delete_if_expired(&self, key: &str, max_age: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired = entries
            .get(key)
            .is_some_and(|entry| entry.is_expired(now, max_age));
        if expired {
            entries.remove(key);
        }
        expired
    }
}
