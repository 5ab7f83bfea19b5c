//! Ingest adapter boundary.
//!
//! The partitioned log transport lives outside the engine; workers consume it
//! through [`IngestAdapter`]. The contract is at-least-once: the engine
//! commits a cursor only after an event's effects are reflected in the state
//! store, so events after the last committed cursor may be redelivered on
//! restart and every downstream operation must re-apply cleanly.
//!
//! Payloads that fail to parse at the transport boundary arrive as
//! [`IngestItem::Malformed`] so the worker can quarantine them and keep the
//! cursor moving.

use crate::error::EngineError;
use crate::event::Event;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Mutex;

/// One pull from a partition.
#[derive(Debug, Clone)]
pub enum IngestItem {
    Event(Event),
    /// Unparseable payload; carries the raw bytes as JSON for quarantine.
    Malformed {
        partition: u32,
        offset: u64,
        raw: serde_json::Value,
        reason: String,
    },
    /// No further events will arrive on this partition.
    EndOfPartition,
}

impl IngestItem {
    /// Offset of the item, when it occupies one.
    pub fn offset(&self) -> Option<u64> {
        match self {
            IngestItem::Event(event) => Some(event.offset),
            IngestItem::Malformed { offset, .. } => Some(*offset),
            IngestItem::EndOfPartition => None,
        }
    }
}

/// Source of partitioned, ordered events.
#[async_trait]
pub trait IngestAdapter: Send + Sync {
    /// Partitions assigned to this engine instance.
    fn partitions(&self) -> Vec<u32>;

    /// Pull the next item for a partition, awaiting until one is available.
    async fn next_event(&self, partition: u32) -> Result<IngestItem, EngineError>;

    /// Mark an offset as fully applied; redelivery resumes after it.
    async fn commit_cursor(&self, partition: u32, offset: u64) -> Result<(), EngineError>;

    /// Reposition a partition to resume at `offset`.
    async fn seek(&self, partition: u32, offset: u64) -> Result<(), EngineError>;
}

#[derive(Default)]
struct PartitionLog {
    items: Vec<IngestItem>,
    position: usize,
}

/// In-memory adapter backed by pre-loaded per-partition logs.
///
/// Replays deterministically: `seek` repositions by offset, which is how
/// crash-restart tests re-consume uncommitted suffixes.
#[derive(Default)]
pub struct MemoryAdapter {
    logs: Mutex<FxHashMap<u32, PartitionLog>>,
    committed: Mutex<FxHashMap<u32, u64>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event to its partition's log.
    pub fn push(&self, event: Event) {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.entry(event.partition)
            .or_default()
            .items
            .push(IngestItem::Event(event));
    }

    /// Append an unparseable payload.
    pub fn push_malformed(&self, partition: u32, offset: u64, raw: serde_json::Value, reason: impl Into<String>) {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        logs.entry(partition).or_default().items.push(IngestItem::Malformed {
            partition,
            offset,
            raw,
            reason: reason.into(),
        });
    }

    pub fn from_events(events: impl IntoIterator<Item = Event>) -> Self {
        let adapter = Self::new();
        for event in events {
            adapter.push(event);
        }
        adapter
    }

    /// Last committed offset per partition.
    pub fn committed(&self, partition: u32) -> Option<u64> {
        self.committed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&partition)
            .copied()
    }
}

#[async_trait]
impl IngestAdapter for MemoryAdapter {
    fn partitions(&self) -> Vec<u32> {
        let logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        let mut partitions: Vec<u32> = logs.keys().copied().collect();
        partitions.sort_unstable();
        partitions
    }

    async fn next_event(&self, partition: u32) -> Result<IngestItem, EngineError> {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(log) = logs.get_mut(&partition) else {
            return Ok(IngestItem::EndOfPartition);
        };
        match log.items.get(log.position) {
            Some(item) => {
                log.position += 1;
                Ok(item.clone())
            }
            None => Ok(IngestItem::EndOfPartition),
        }
    }

    async fn commit_cursor(&self, partition: u32, offset: u64) -> Result<(), EngineError> {
        self.committed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(partition, offset);
        Ok(())
    }

    async fn seek(&self, partition: u32, offset: u64) -> Result<(), EngineError> {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(log) = logs.get_mut(&partition) else {
            return Ok(());
        };
        log.position = log
            .items
            .iter()
            .position(|item| item.offset().is_some_and(|o| o >= offset))
            .unwrap_or(log.items.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn event(partition: u32, offset: u64) -> Event {
        Event::new(partition, offset)
            .with_key("A")
            .with_value(1.0)
            .with_event_time(Utc.timestamp_opt(offset as i64, 0).unwrap())
    }

    #[tokio::test]
    async fn test_pull_order_and_end() {
        let adapter = MemoryAdapter::from_events([event(0, 0), event(0, 1)]);

        let IngestItem::Event(first) = adapter.next_event(0).await.unwrap() else {
            panic!("expected event");
        };
        assert_eq!(first.offset, 0);
        let IngestItem::Event(second) = adapter.next_event(0).await.unwrap() else {
            panic!("expected event");
        };
        assert_eq!(second.offset, 1);
        assert!(matches!(
            adapter.next_event(0).await.unwrap(),
            IngestItem::EndOfPartition
        ));
    }

    #[tokio::test]
    async fn test_seek_replays_suffix() {
        let adapter = MemoryAdapter::from_events([event(0, 0), event(0, 1), event(0, 2)]);
        for _ in 0..3 {
            adapter.next_event(0).await.unwrap();
        }

        adapter.seek(0, 1).await.unwrap();
        let IngestItem::Event(replayed) = adapter.next_event(0).await.unwrap() else {
            panic!("expected event");
        };
        assert_eq!(replayed.offset, 1);
    }

    #[tokio::test]
    async fn test_commit_cursor_tracked() {
        let adapter = MemoryAdapter::from_events([event(2, 5)]);
        assert_eq!(adapter.committed(2), None);

        adapter.commit_cursor(2, 5).await.unwrap();
        assert_eq!(adapter.committed(2), Some(5));
    }

    #[tokio::test]
    async fn test_partitions_sorted() {
        let adapter = MemoryAdapter::from_events([event(3, 0), event(1, 0)]);
        assert_eq!(adapter.partitions(), vec![1, 3]);
    }
}
