use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use uns_api::RetainedStore;

// ═══════════════════════════════════════════════════════════════
//  RetainedTable
// ═══════════════════════════════════════════════════════════════

/// In-memory latest-value table, one entry per exact topic string.
/// Process-lifetime only; entries never expire.
#[derive(Default)]
pub struct RetainedTable {
    entries: RwLock<HashMap<String, Value>>,
}

impl RetainedTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Value>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("retained table read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Value>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("retained table write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl RetainedStore for RetainedTable {
    fn put(&self, topic: &str, value: Value) {
        self.write().insert(topic.to_string(), value);
    }

    fn get(&self, topics: &[&str]) -> HashMap<String, Value> {
        let entries = self.read();
        topics
            .iter()
            .filter_map(|t| entries.get(*t).map(|v| (t.to_string(), v.clone())))
            .collect()
    }

    fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }
}

// ═══════════════════════════════════════════════════════════════
//  HistoryWindow
// ═══════════════════════════════════════════════════════════════

/// Number of records a history window keeps.
pub const HISTORY_CAPACITY: usize = 60;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub value: Value,
}

/// Bounded FIFO of recent records. A single timeline shared by every topic
/// the feeding worker subscribes to; once full, the oldest record is evicted
/// before the new one is appended.
pub struct HistoryWindow {
    records: Mutex<VecDeque<HistoryRecord>>,
    capacity: usize,
}

impl Default for HistoryWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryWindow {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn append(&self, topic: &str, timestamp: DateTime<Utc>, value: Value) {
        let mut buf = self.lock();
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(HistoryRecord {
            topic: topic.to_string(),
            timestamp,
            value,
        });
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the window, oldest first.
    pub fn snapshot(&self) -> Vec<HistoryRecord> {
        self.lock().iter().cloned().collect()
    }

    /// Records of one topic still in the window, oldest first.
    pub fn for_topic(&self, topic: &str) -> Vec<HistoryRecord> {
        self.lock().iter().filter(|r| r.topic == topic).cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<HistoryRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("history window lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
