//! Error kinds for the engine.
//!
//! Most conditions are handled locally with a counter and forward progress
//! continues; only [`EngineError::is_fatal`] conditions halt the affected
//! partition worker.

use crate::event::Key;
use chrono::{DateTime, Utc};

/// Engine error taxonomy.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Unparseable payload. Quarantined and counted; processing continues.
    MalformedEvent {
        partition: u32,
        offset: u64,
        reason: String,
    },
    /// Event time behind `watermark - grace`, or its window already closed.
    /// Rejected and counted; never applied.
    LateEvent {
        key: Key,
        event_time: DateTime<Utc>,
        watermark: DateTime<Utc>,
    },
    /// Event without a key cannot be windowed or joined. Quarantined.
    NullKeyEvent { partition: u32, offset: u64 },
    /// Table-side join miss. Dropped or emitted as left-outer null per
    /// configuration; never fatal.
    LookupMiss { key: Key },
    /// Restore in progress, or snapshot/restore attempted while workers run.
    StoreUnavailable,
    /// A subscriber queue overflowed; a gap frame was emitted in place of the
    /// oldest undelivered notification.
    SubscriberOverflow { subscriber: uuid::Uuid, key: Key },
    /// Snapshot blob failed to decode. Fatal.
    CorruptSnapshot(String),
    /// The ingest adapter failed irrecoverably. Fatal for its partition.
    AdapterFailed(String),
}

impl EngineError {
    /// Only unrecoverable conditions halt a partition worker.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::CorruptSnapshot(_) | EngineError::AdapterFailed(_)
        )
    }

    /// Stable label for metrics and quarantine entries.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::MalformedEvent { .. } => "malformed_event",
            EngineError::LateEvent { .. } => "late_event",
            EngineError::NullKeyEvent { .. } => "null_key_event",
            EngineError::LookupMiss { .. } => "lookup_miss",
            EngineError::StoreUnavailable => "store_unavailable",
            EngineError::SubscriberOverflow { .. } => "subscriber_overflow",
            EngineError::CorruptSnapshot(_) => "corrupt_snapshot",
            EngineError::AdapterFailed(_) => "adapter_failed",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::MalformedEvent {
                partition,
                offset,
                reason,
            } => write!(
                f,
                "malformed event at partition {} offset {}: {}",
                partition, offset, reason
            ),
            EngineError::LateEvent {
                key,
                event_time,
                watermark,
            } => write!(
                f,
                "late event for key '{}': event time {} behind watermark {}",
                key, event_time, watermark
            ),
            EngineError::NullKeyEvent { partition, offset } => write!(
                f,
                "null-key event at partition {} offset {}",
                partition, offset
            ),
            EngineError::LookupMiss { key } => {
                write!(f, "table lookup miss for key '{}'", key)
            }
            EngineError::StoreUnavailable => write!(f, "state store unavailable"),
            EngineError::SubscriberOverflow { subscriber, key } => write!(
                f,
                "subscriber {} queue overflow on key '{}'",
                subscriber, key
            ),
            EngineError::CorruptSnapshot(reason) => {
                write!(f, "corrupt snapshot blob: {}", reason)
            }
            EngineError::AdapterFailed(reason) => {
                write!(f, "ingest adapter failed: {}", reason)
            }
        }
    }
}

impl std::error::Error for EngineError {}
