//! Per-partition watermark tracking.
//!
//! A partition's watermark is the maximum event time it has observed minus the
//! allowed out-of-orderness. Watermarks never recede; events behind
//! `watermark - grace` are rejected by the window manager.

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Tracks a watermark per input partition.
#[derive(Debug)]
pub struct PartitionWatermarks {
    partitions: FxHashMap<u32, PartitionClock>,
    out_of_orderness: Duration,
}

#[derive(Debug, Default)]
struct PartitionClock {
    max_event_time: Option<DateTime<Utc>>,
    watermark: Option<DateTime<Utc>>,
}

impl PartitionWatermarks {
    pub fn new(out_of_orderness: Duration) -> Self {
        Self {
            partitions: FxHashMap::default(),
            out_of_orderness,
        }
    }

    /// Observe an event time, advancing the partition's watermark if it moved.
    ///
    /// Returns the new watermark when it advanced, `None` otherwise.
    pub fn observe(&mut self, partition: u32, event_time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let clock = self.partitions.entry(partition).or_default();

        let moved = match clock.max_event_time {
            Some(max) if event_time > max => {
                clock.max_event_time = Some(event_time);
                true
            }
            None => {
                clock.max_event_time = Some(event_time);
                true
            }
            _ => false,
        };

        if !moved {
            return None;
        }

        let candidate = clock.max_event_time.unwrap() - self.out_of_orderness;
        match clock.watermark {
            // Watermark never recedes.
            Some(current) if candidate <= current => None,
            _ => {
                clock.watermark = Some(candidate);
                Some(candidate)
            }
        }
    }

    /// Current watermark for a partition, if any event has been observed.
    pub fn watermark(&self, partition: u32) -> Option<DateTime<Utc>> {
        self.partitions.get(&partition).and_then(|c| c.watermark)
    }

    /// Lowest watermark across all partitions that have one. Cross-partition
    /// state (join buffers) may only be discarded behind this point.
    pub fn min_watermark(&self) -> Option<DateTime<Utc>> {
        self.partitions.values().filter_map(|c| c.watermark).min()
    }

    /// Force a partition's watermark forward (restore path).
    pub fn advance_to(&mut self, partition: u32, watermark: DateTime<Utc>) {
        let clock = self.partitions.entry(partition).or_default();
        match clock.watermark {
            Some(current) if watermark <= current => {}
            _ => clock.watermark = Some(watermark),
        }
        match clock.max_event_time {
            Some(max) if watermark + self.out_of_orderness <= max => {}
            _ => clock.max_event_time = Some(watermark + self.out_of_orderness),
        }
    }

    /// Capture per-partition watermarks for the snapshot blob.
    pub fn capture(&self) -> Vec<WatermarkEntry> {
        let mut entries: Vec<WatermarkEntry> = self
            .partitions
            .iter()
            .filter_map(|(partition, clock)| {
                clock.watermark.map(|wm| WatermarkEntry {
                    partition: *partition,
                    watermark_ms: wm.timestamp_millis(),
                })
            })
            .collect();
        entries.sort_by_key(|e| e.partition);
        entries
    }

    /// Re-seed from captured entries.
    pub fn restore(&mut self, entries: &[WatermarkEntry]) {
        for entry in entries {
            if let Some(wm) = DateTime::from_timestamp_millis(entry.watermark_ms) {
                self.advance_to(entry.partition, wm);
            }
        }
    }
}

/// A partition watermark as stored in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkEntry {
    pub partition: u32,
    pub watermark_ms: i64,
}
