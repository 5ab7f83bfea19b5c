//! Key + window indexed state store.
//!
//! The store is logically partitioned into shards hashed by key, so
//! concurrent mutation from different partition workers touching different
//! keys contends only on the shard lock; no global lock is held during normal
//! operation. Each entry is replaced whole under the shard's write lock, so a
//! reader never observes a partially-applied update and per-key reads are
//! monotonic.
//!
//! Two namespaces per key:
//! - a *latest* slot (plain key, no window) used by the table-join lookup
//!   side and join-output materialization; writes are last-write-wins
//! - *windowed* entries ordered by window start, serving point gets and
//!   time-range scans over aggregation results
//!
//! Snapshot/restore moves whole store contents; restore is only valid while
//! the pipeline is quiesced and flips the store into a rebuilding state that
//! rejects writes until it completes.

use crate::error::EngineError;
use crate::event::Key;
use crate::window::Window;
use chrono::{DateTime, Utc};
use freshet_core::Value;
use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::info;

const SHARD_COUNT: usize = 16;

type WindowKey = (DateTime<Utc>, DateTime<Utc>);

#[derive(Default)]
struct Shard {
    latest: FxHashMap<Key, Value>,
    windowed: FxHashMap<Key, BTreeMap<WindowKey, Value>>,
}

/// Sharded in-memory state store.
pub struct StateStore {
    shards: Vec<RwLock<Shard>>,
    rebuilding: AtomicBool,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(Shard::default())).collect(),
            rebuilding: AtomicBool::new(false),
        }
    }

    fn shard(&self, key: &str) -> &RwLock<Shard> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Whether a restore is in progress.
    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding.load(Ordering::Acquire)
    }

    fn check_writable(&self) -> Result<(), EngineError> {
        if self.is_rebuilding() {
            Err(EngineError::StoreUnavailable)
        } else {
            Ok(())
        }
    }

    /// Write the latest-value slot for a key (last-write-wins).
    ///
    /// Returns the previous value, if any.
    pub fn put_latest(&self, key: &Key, value: Value) -> Result<Option<Value>, EngineError> {
        self.check_writable()?;
        let mut shard = self.shard(key).write().unwrap_or_else(|e| e.into_inner());
        Ok(shard.latest.insert(key.clone(), value))
    }

    /// Read the latest-value slot for a key.
    pub fn get_latest(&self, key: &str) -> Option<Value> {
        let shard = self.shard(key).read().unwrap_or_else(|e| e.into_inner());
        shard.latest.get(key).cloned()
    }

    /// Atomically replace the value for a `(key, window)` entry.
    ///
    /// Returns the previous value, if any.
    pub fn put_windowed(&self, window: &Window, value: Value) -> Result<Option<Value>, EngineError> {
        self.check_writable()?;
        let mut shard = self
            .shard(&window.key)
            .write()
            .unwrap_or_else(|e| e.into_inner());
        Ok(shard
            .windowed
            .entry(window.key.clone())
            .or_default()
            .insert((window.start, window.end), value))
    }

    /// Point read of a windowed entry.
    pub fn get_windowed(&self, window: &Window) -> Option<Value> {
        let shard = self
            .shard(&window.key)
            .read()
            .unwrap_or_else(|e| e.into_inner());
        shard
            .windowed
            .get(&window.key)
            .and_then(|entries| entries.get(&(window.start, window.end)))
            .cloned()
    }

    /// Windowed entries for a key whose start falls in `[from, to)`,
    /// ascending by window start.
    pub fn range_scan(
        &self,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<(Window, Value)> {
        let shard = self.shard(key).read().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = shard.windowed.get(key) else {
            return Vec::new();
        };
        let key: Key = key.into();
        entries
            .range((from, DateTime::<Utc>::MIN_UTC)..(to, DateTime::<Utc>::MIN_UTC))
            .map(|((start, end), value)| (Window::new(key.clone(), *start, *end), value.clone()))
            .collect()
    }

    /// Drop an evicted window's entry; the slot becomes garbage.
    pub fn remove_window(&self, window: &Window) -> Option<Value> {
        let mut shard = self
            .shard(&window.key)
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let entries = shard.windowed.get_mut(&window.key)?;
        let removed = entries.remove(&(window.start, window.end));
        if entries.is_empty() {
            shard.windowed.remove(&window.key);
        }
        removed
    }

    /// All live entries, for the snapshot blob.
    pub fn capture(&self) -> (Vec<LatestEntry>, Vec<WindowedEntry>) {
        let mut latest = Vec::new();
        let mut windowed = Vec::new();
        for lock in &self.shards {
            let shard = lock.read().unwrap_or_else(|e| e.into_inner());
            for (key, value) in &shard.latest {
                latest.push(LatestEntry {
                    key: key.to_string(),
                    value: value.clone(),
                });
            }
            for (key, entries) in &shard.windowed {
                for ((start, end), value) in entries {
                    windowed.push(WindowedEntry {
                        key: key.to_string(),
                        start_ms: start.timestamp_millis(),
                        end_ms: end.timestamp_millis(),
                        value: value.clone(),
                    });
                }
            }
        }
        latest.sort_by(|a, b| a.key.cmp(&b.key));
        windowed.sort_by(|a, b| a.key.cmp(&b.key).then(a.start_ms.cmp(&b.start_ms)));
        (latest, windowed)
    }

    /// Replace all store contents. Only valid while the pipeline is quiesced;
    /// reads during the swap serve pre-restore data, writes are rejected
    /// until it completes.
    pub fn restore_from(&self, latest: Vec<LatestEntry>, windowed: Vec<WindowedEntry>) {
        self.rebuilding.store(true, Ordering::Release);

        for lock in &self.shards {
            let mut shard = lock.write().unwrap_or_else(|e| e.into_inner());
            shard.latest.clear();
            shard.windowed.clear();
        }
        for entry in latest {
            let key: Key = entry.key.as_str().into();
            let mut shard = self.shard(&key).write().unwrap_or_else(|e| e.into_inner());
            shard.latest.insert(key.clone(), entry.value);
        }
        let mut count = 0usize;
        for entry in windowed {
            let key: Key = entry.key.as_str().into();
            let start = DateTime::from_timestamp_millis(entry.start_ms).unwrap_or_default();
            let end = DateTime::from_timestamp_millis(entry.end_ms).unwrap_or_default();
            let mut shard = self.shard(&key).write().unwrap_or_else(|e| e.into_inner());
            shard
                .windowed
                .entry(key.clone())
                .or_default()
                .insert((start, end), entry.value);
            count += 1;
        }

        self.rebuilding.store(false, Ordering::Release);
        info!(windowed = count, "state store restored");
    }

    /// Total number of live entries across both namespaces.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|lock| {
                let shard = lock.read().unwrap_or_else(|e| e.into_inner());
                shard.latest.len()
                    + shard.windowed.values().map(BTreeMap::len).sum::<usize>()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A latest-slot entry as stored in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestEntry {
    pub key: String,
    pub value: Value,
}

/// A windowed entry as stored in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowedEntry {
    pub key: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub value: Value,
}
