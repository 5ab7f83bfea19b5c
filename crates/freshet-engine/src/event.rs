//! Event types for the engine.

use chrono::{DateTime, Utc};
use freshet_core::Value;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Join key type. `Arc<str>` for O(1) clone instead of O(n) String clone;
/// `None` marks an event that cannot be keyed (quarantined downstream).
pub type Key = Arc<str>;

/// An immutable event ingested from one partition of the log.
///
/// Ordering is guaranteed only within a partition: `offset` is strictly
/// increasing and `event_time` is monotonically non-decreasing per partition.
/// Across partitions no ordering is assumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Partition this event was read from.
    pub partition: u32,
    /// Offset/cursor within the partition.
    pub offset: u64,
    /// Join key, absent for unkeyed events.
    pub key: Option<Key>,
    /// Event payload.
    pub value: Value,
    /// Event time assigned by the producer.
    #[serde(default = "Utc::now")]
    pub event_time: DateTime<Utc>,
}

impl Event {
    pub fn new(partition: u32, offset: u64) -> Self {
        Self {
            partition,
            offset,
            key: None,
            value: Value::Null,
            event_time: Utc::now(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_event_time(mut self, ts: DateTime<Utc>) -> Self {
        self.event_time = ts;
        self
    }

    /// Payload field lookup; `None` unless the payload is a map.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.value.get(field)
    }

    /// Numeric view of a payload field, or of the whole payload when it is a
    /// bare number.
    pub fn get_float(&self, field: &str) -> Option<f64> {
        match self.value.get(field) {
            Some(v) => v.as_float(),
            None => self.value.as_float(),
        }
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.value.get(field).and_then(|v| v.as_str())
    }
}
