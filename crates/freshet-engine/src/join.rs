//! Three join topologies behind one interface.
//!
//! The topology is selected by configuration and dispatched as a tagged
//! variant, not a trait-object hierarchy:
//!
//! - **Stream-stream**: both sides are streams. Each incoming event scans the
//!   other side's buffer for the first unmatched candidate within
//!   `±join_window` of its timestamp (first-match-wins; a matched event is
//!   never reused). Buffers hold events only until the watermark moves past
//!   their maximum window reach.
//! - **Stream-table**: the right side materializes a latest-value-per-key
//!   table (its own [`StateStore`]); each left event does a point lookup by
//!   its own key.
//! - **Stream-global-table**: same lookup semantics, but the table is not
//!   partitioned by the stream's key space; the lookup key comes from a
//!   configured payload field of the left event.
//!
//! Table-side duplicates resolve last-write-wins. A lookup miss is an inner
//! drop or a left-outer null, per configuration, never fatal.

use crate::config::JoinConfig;
use crate::error::EngineError;
use crate::event::{Event, Key};
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use freshet_core::Value;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// Join topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    StreamStream,
    StreamTable,
    StreamGlobalTable,
}

/// Behavior on a table-side lookup miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinMode {
    /// Miss drops the left event.
    Inner,
    /// Miss emits a record with a null right value.
    LeftOuter,
}

/// Which side of the join an event feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSide {
    Left,
    Right,
}

/// A matched pair (or left-outer single).
///
/// Stream-stream joins produce at most one record per matched pair; table
/// joins produce one record per left event, using the right side's value as
/// of processing time.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRecord {
    pub key: Key,
    pub left_value: Value,
    pub right_value: Option<Value>,
    /// Matching window for stream-stream joins, `None` for table lookups.
    pub join_window: Option<chrono::Duration>,
    pub matched_at: DateTime<Utc>,
}

impl JoinedRecord {
    /// Encode as a generic store value for materialization.
    pub fn to_value(&self) -> Value {
        Value::map_from([
            ("left".to_string(), self.left_value.clone()),
            (
                "right".to_string(),
                self.right_value.clone().unwrap_or(Value::Null),
            ),
        ])
    }
}

/// Result of feeding one event through the join.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    /// A joined record was produced.
    Matched(JoinedRecord),
    /// Stream-stream: no candidate yet, event buffered for future arrivals.
    Buffered,
    /// Table kinds: a right-side event refreshed the lookup table.
    TableUpdated,
}

#[derive(Debug)]
struct BufferedEvent {
    event_time: DateTime<Utc>,
    value: Value,
    matched: bool,
}

#[derive(Debug, Default)]
struct SideBuffer {
    by_key: FxHashMap<Key, VecDeque<BufferedEvent>>,
}

impl SideBuffer {
    /// First unmatched entry within `±window` of `at`, in arrival order.
    fn take_candidate(
        &mut self,
        key: &Key,
        at: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Option<(DateTime<Utc>, Value)> {
        let entries = self.by_key.get_mut(key)?;
        let entry = entries
            .iter_mut()
            .find(|e| !e.matched && (e.event_time - at).abs() <= window)?;
        entry.matched = true;
        Some((entry.event_time, entry.value.clone()))
    }

    fn push(&mut self, key: Key, event_time: DateTime<Utc>, value: Value) {
        self.by_key
            .entry(key)
            .or_default()
            .push_back(BufferedEvent {
                event_time,
                value,
                matched: false,
            });
    }

    fn evict_before(&mut self, horizon: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        self.by_key.retain(|_, entries| {
            while entries
                .front()
                .is_some_and(|e| e.event_time < horizon)
            {
                entries.pop_front();
                evicted += 1;
            }
            !entries.is_empty()
        });
        evicted
    }

    fn len(&self) -> usize {
        self.by_key.values().map(VecDeque::len).sum()
    }
}

/// Executes the configured join topology.
///
/// The table used by the table-style kinds is a separate [`StateStore`]
/// shared with the engine (and, for global tables, across all workers).
pub struct JoinEngine {
    config: JoinConfig,
    table: Arc<StateStore>,
    left: SideBuffer,
    right: SideBuffer,
}

impl JoinEngine {
    pub fn new(config: JoinConfig, table: Arc<StateStore>) -> Self {
        Self {
            config,
            table,
            left: SideBuffer::default(),
            right: SideBuffer::default(),
        }
    }

    /// The latest-value table backing the lookup side.
    pub fn table(&self) -> &Arc<StateStore> {
        &self.table
    }

    /// Feed one event through the join.
    ///
    /// A `LookupMiss` is returned for inner-mode table misses; the caller
    /// counts it and moves on, it is never fatal.
    pub fn process(&mut self, event: &Event) -> Result<JoinOutcome, EngineError> {
        let side = self.config.side_of(event.partition);
        match self.config.kind {
            JoinKind::StreamStream => self.process_stream_stream(event, side),
            JoinKind::StreamTable => self.process_table(event, side, None),
            JoinKind::StreamGlobalTable => {
                let field = self.config.foreign_key_field.clone();
                self.process_table(event, side, field.as_deref())
            }
        }
    }

    fn process_stream_stream(
        &mut self,
        event: &Event,
        side: JoinSide,
    ) -> Result<JoinOutcome, EngineError> {
        let key = require_key(event)?;
        let window = self.config.join_window;

        let (own, other) = match side {
            JoinSide::Left => (&mut self.left, &mut self.right),
            JoinSide::Right => (&mut self.right, &mut self.left),
        };

        if let Some((candidate_time, candidate_value)) =
            other.take_candidate(&key, event.event_time, window)
        {
            trace!(key = %key, ?side, candidate = %candidate_time, "stream-stream match");
            let (left_value, right_value) = match side {
                JoinSide::Left => (event.value.clone(), candidate_value),
                JoinSide::Right => (candidate_value, event.value.clone()),
            };
            return Ok(JoinOutcome::Matched(JoinedRecord {
                key,
                left_value,
                right_value: Some(right_value),
                join_window: Some(window),
                matched_at: Utc::now(),
            }));
        }

        own.push(key, event.event_time, event.value.clone());
        Ok(JoinOutcome::Buffered)
    }

    fn process_table(
        &mut self,
        event: &Event,
        side: JoinSide,
        foreign_key_field: Option<&str>,
    ) -> Result<JoinOutcome, EngineError> {
        if side == JoinSide::Right {
            // Table refresh, last-write-wins.
            let key = require_key(event)?;
            self.table.put_latest(&key, event.value.clone())?;
            return Ok(JoinOutcome::TableUpdated);
        }

        let lookup_key: Key = match foreign_key_field {
            Some(field) => match event.get_str(field) {
                Some(fk) => fk.into(),
                None => {
                    return Err(EngineError::NullKeyEvent {
                        partition: event.partition,
                        offset: event.offset,
                    })
                }
            },
            None => require_key(event)?,
        };

        match self.table.get_latest(&lookup_key) {
            Some(right) => Ok(JoinOutcome::Matched(JoinedRecord {
                key: lookup_key,
                left_value: event.value.clone(),
                right_value: Some(right),
                join_window: None,
                matched_at: Utc::now(),
            })),
            None => match self.config.mode {
                JoinMode::Inner => Err(EngineError::LookupMiss { key: lookup_key }),
                JoinMode::LeftOuter => Ok(JoinOutcome::Matched(JoinedRecord {
                    key: lookup_key,
                    left_value: event.value.clone(),
                    right_value: None,
                    join_window: None,
                    matched_at: Utc::now(),
                })),
            },
        }
    }

    /// Drop buffered events the watermark has moved past.
    ///
    /// An event can still match arrivals up to `join_window` newer than
    /// itself, so the horizon is `watermark - join_window`.
    pub fn evict_before(&mut self, watermark: DateTime<Utc>) -> usize {
        let horizon = watermark - self.config.join_window;
        let evicted = self.left.evict_before(horizon) + self.right.evict_before(horizon);
        if evicted > 0 {
            debug!(evicted, %horizon, "join buffers evicted");
        }
        evicted
    }

    /// Total buffered events across both sides.
    pub fn buffered(&self) -> usize {
        self.left.len() + self.right.len()
    }
}

fn require_key(event: &Event) -> Result<Key, EngineError> {
    event.key.clone().ok_or(EngineError::NullKeyEvent {
        partition: event.partition,
        offset: event.offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn event(partition: u32, offset: u64, key: &str, value: Value, secs: i64) -> Event {
        Event::new(partition, offset)
            .with_key(key)
            .with_value(value)
            .with_event_time(at(secs))
    }

    fn stream_stream(window_secs: i64) -> JoinEngine {
        let config =
            JoinConfig::stream_stream(Duration::seconds(window_secs)).with_right_partitions([1]);
        JoinEngine::new(config, Arc::new(StateStore::new()))
    }

    #[test]
    fn test_stream_stream_matches_within_window() {
        let mut join = stream_stream(30);

        let out = join
            .process(&event(1, 0, "A", Value::Int(1), 100))
            .unwrap();
        assert_eq!(out, JoinOutcome::Buffered);

        let out = join
            .process(&event(0, 0, "A", Value::Int(2), 110))
            .unwrap();
        let JoinOutcome::Matched(record) = out else {
            panic!("expected match, got {:?}", out);
        };
        assert_eq!(&*record.key, "A");
        assert_eq!(record.left_value, Value::Int(2));
        assert_eq!(record.right_value, Some(Value::Int(1)));
    }

    #[test]
    fn test_stream_stream_outside_window_buffers() {
        let mut join = stream_stream(30);

        join.process(&event(1, 0, "A", Value::Int(1), 100)).unwrap();
        let out = join
            .process(&event(0, 0, "A", Value::Int(2), 131))
            .unwrap();
        assert_eq!(out, JoinOutcome::Buffered);
        assert_eq!(join.buffered(), 2);
    }

    #[test]
    fn test_first_match_wins_right_event_never_reused() {
        let mut join = stream_stream(30);

        join.process(&event(1, 0, "A", Value::Int(10), 100)).unwrap();

        // First left event consumes the right event.
        let first = join.process(&event(0, 0, "A", Value::Int(1), 105)).unwrap();
        assert!(matches!(first, JoinOutcome::Matched(_)));

        // Second left event inside the window finds nothing.
        let second = join.process(&event(0, 1, "A", Value::Int(2), 106)).unwrap();
        assert_eq!(second, JoinOutcome::Buffered);
    }

    #[test]
    fn test_candidates_drained_in_arrival_order() {
        let mut join = stream_stream(30);
        join.process(&event(1, 0, "A", Value::Int(1), 100)).unwrap();
        join.process(&event(1, 1, "A", Value::Int(2), 101)).unwrap();

        let out = join.process(&event(0, 0, "A", Value::Int(0), 102)).unwrap();
        let JoinOutcome::Matched(record) = out else {
            panic!("expected match");
        };
        assert_eq!(record.right_value, Some(Value::Int(1)));
    }

    #[test]
    fn test_keys_do_not_cross_match() {
        let mut join = stream_stream(30);
        join.process(&event(1, 0, "A", Value::Int(1), 100)).unwrap();

        let out = join.process(&event(0, 0, "B", Value::Int(2), 100)).unwrap();
        assert_eq!(out, JoinOutcome::Buffered);
    }

    #[test]
    fn test_eviction_bounds_buffers() {
        let mut join = stream_stream(30);
        join.process(&event(1, 0, "A", Value::Int(1), 100)).unwrap();
        join.process(&event(1, 1, "A", Value::Int(2), 200)).unwrap();
        assert_eq!(join.buffered(), 2);

        // Horizon is watermark - join_window; only the t=100 entry is stale.
        assert_eq!(join.evict_before(at(170)), 1);
        assert_eq!(join.buffered(), 1);
    }

    #[test]
    fn test_null_key_rejected() {
        let mut join = stream_stream(30);
        let bare = Event::new(0, 0).with_value(1).with_event_time(at(10));

        let err = join.process(&bare).unwrap_err();
        assert!(matches!(err, EngineError::NullKeyEvent { .. }));
    }

    #[test]
    fn test_stream_table_price_lookup() {
        // Table has {"p1": 9.99}; stream event for p1 joins, p2 misses.
        let config = JoinConfig::stream_table(JoinMode::Inner).with_right_partitions([1]);
        let mut join = JoinEngine::new(config, Arc::new(StateStore::new()));

        let out = join
            .process(&event(1, 0, "p1", Value::Float(9.99), 10))
            .unwrap();
        assert_eq!(out, JoinOutcome::TableUpdated);

        let qty = Value::map_from([("qty".to_string(), Value::Int(3))]);
        let out = join.process(&event(0, 0, "p1", qty.clone(), 20)).unwrap();
        let JoinOutcome::Matched(record) = out else {
            panic!("expected match");
        };
        assert_eq!(record.left_value, qty);
        assert_eq!(record.right_value, Some(Value::Float(9.99)));

        let err = join
            .process(&event(0, 1, "p2", Value::Int(1), 30))
            .unwrap_err();
        assert!(matches!(err, EngineError::LookupMiss { .. }));
    }

    #[test]
    fn test_stream_table_left_outer_null_on_miss() {
        let config = JoinConfig::stream_table(JoinMode::LeftOuter).with_right_partitions([1]);
        let mut join = JoinEngine::new(config, Arc::new(StateStore::new()));

        let out = join.process(&event(0, 0, "p2", Value::Int(1), 10)).unwrap();
        let JoinOutcome::Matched(record) = out else {
            panic!("expected left-outer record");
        };
        assert_eq!(record.right_value, None);
        assert_eq!(record.to_value().get("right"), Some(&Value::Null));
    }

    #[test]
    fn test_table_duplicate_keys_last_write_wins() {
        let config = JoinConfig::stream_table(JoinMode::Inner).with_right_partitions([1]);
        let mut join = JoinEngine::new(config, Arc::new(StateStore::new()));

        join.process(&event(1, 0, "p1", Value::Float(9.99), 10))
            .unwrap();
        join.process(&event(1, 1, "p1", Value::Float(10.49), 11))
            .unwrap();

        let out = join.process(&event(0, 0, "p1", Value::Int(1), 20)).unwrap();
        let JoinOutcome::Matched(record) = out else {
            panic!("expected match");
        };
        assert_eq!(record.right_value, Some(Value::Float(10.49)));
    }

    #[test]
    fn test_global_table_foreign_key_lookup() {
        let config = JoinConfig::stream_global_table(JoinMode::Inner, "product_id")
            .with_right_partitions([9]);
        let mut join = JoinEngine::new(config, Arc::new(StateStore::new()));

        join.process(&event(9, 0, "sku-7", Value::Float(4.5), 5))
            .unwrap();

        // Left event is keyed by order id; lookup uses the payload field.
        let order = Value::map_from([(
            "product_id".to_string(),
            Value::Str("sku-7".to_string()),
        )]);
        let out = join.process(&event(0, 0, "order-1", order, 10)).unwrap();
        let JoinOutcome::Matched(record) = out else {
            panic!("expected match");
        };
        assert_eq!(&*record.key, "sku-7");
        assert_eq!(record.right_value, Some(Value::Float(4.5)));
    }

    #[test]
    fn test_global_table_missing_foreign_key_field() {
        let config = JoinConfig::stream_global_table(JoinMode::Inner, "product_id")
            .with_right_partitions([9]);
        let mut join = JoinEngine::new(config, Arc::new(StateStore::new()));

        let err = join
            .process(&event(0, 0, "order-1", Value::Int(1), 10))
            .unwrap_err();
        assert!(matches!(err, EngineError::NullKeyEvent { .. }));
    }
}
