//! Time windows and their lifecycle.
//!
//! Windows are half-open `[start, end)` intervals: an event whose time equals
//! `end` belongs to the next window, never the one ending there. Tumbling
//! windows partition time into fixed non-overlapping intervals; hopping
//! windows advance by a step smaller than their size, so one event maps to
//! `ceil(size / advance)` windows.
//!
//! Lifecycle per window, driven by the owning partition's watermark:
//!
//! ```text
//! OPEN --wm >= end--> CLOSING --wm >= end+grace--> CLOSED --wm >= end+grace+retention--> EVICTED
//! ```
//!
//! Transitions are monotonic; a late event for a CLOSED or EVICTED window is
//! rejected with [`EngineError::LateEvent`], never silently dropped.

use crate::error::EngineError;
use crate::event::{Event, Key};
use crate::watermark::PartitionWatermarks;
use chrono::{DateTime, Duration, Utc};
use freshet_core::time::div_floor;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Windowing scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSpec {
    /// Fixed-size, non-overlapping windows.
    Tumbling { size: Duration },
    /// Fixed-size windows advancing by `advance <= size`.
    Hopping { size: Duration, advance: Duration },
}

impl WindowSpec {
    pub fn tumbling(size: Duration) -> Self {
        debug_assert!(size > Duration::zero());
        WindowSpec::Tumbling { size }
    }

    pub fn hopping(size: Duration, advance: Duration) -> Self {
        debug_assert!(advance > Duration::zero() && advance <= size);
        WindowSpec::Hopping { size, advance }
    }

    /// All `[start, end)` ranges containing `ts`, ascending by start.
    pub fn ranges_for(
        &self,
        ts: DateTime<Utc>,
    ) -> SmallVec<[(DateTime<Utc>, DateTime<Utc>); 4]> {
        let ts_ms = ts.timestamp_millis();
        let mut ranges = SmallVec::new();

        match self {
            WindowSpec::Tumbling { size } => {
                let size_ms = size.num_milliseconds();
                let start_ms = div_floor(ts_ms, size_ms) * size_ms;
                ranges.push((ms(start_ms), ms(start_ms + size_ms)));
            }
            WindowSpec::Hopping { size, advance } => {
                let size_ms = size.num_milliseconds();
                let advance_ms = advance.num_milliseconds();
                // Latest window start at or before ts, then walk back while
                // the window still contains ts.
                let last_start = div_floor(ts_ms, advance_ms) * advance_ms;
                let mut start = last_start;
                while start + size_ms > ts_ms {
                    ranges.push((ms(start), ms(start + size_ms)));
                    start -= advance_ms;
                }
                ranges.reverse();
            }
        }
        ranges
    }
}

fn ms(v: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(v).unwrap_or_default()
}

/// A keyed time window, uniquely identified by `(key, start, end)`.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Window {
    pub key: Key,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(key: impl Into<Key>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        debug_assert!(end > start);
        Self {
            key: key.into(),
            start,
            end,
        }
    }

    /// Half-open containment check.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

impl PartialEq for Window {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.start == other.start && self.end == other.end
    }
}

impl Hash for Window {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
        self.start.hash(state);
        self.end.hash(state);
    }
}

impl Ord for Window {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.start
            .cmp(&other.start)
            .then(self.end.cmp(&other.end))
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for Window {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Lifecycle state attached to a window. Transitions never move backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WindowState {
    Open,
    Closing,
    Closed,
    Evicted,
}

/// A lifecycle transition reported by [`WindowManager::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowTransition {
    /// OPEN -> CLOSING: the watermark passed the window end; the result is
    /// finalized and published, but late events within grace may still revise
    /// it.
    Closing,
    /// CLOSING -> CLOSED: grace elapsed; the result is final.
    Closed,
    /// CLOSED -> EVICTED: retention elapsed; state is garbage-collectable.
    Evicted,
}

#[derive(Debug)]
struct LifecycleEntry {
    state: WindowState,
    partition: u32,
}

/// Assigns events to windows and drives each window's lifecycle from the
/// per-partition watermarks.
///
/// A manager owns only its partition's window lifecycle; the watermark
/// tracker is shared across all managers so cross-partition state (join
/// buffers, snapshots) can see every partition's clock.
pub struct WindowManager {
    spec: WindowSpec,
    grace: Duration,
    retention: Duration,
    watermarks: Arc<Mutex<PartitionWatermarks>>,
    lifecycle: FxHashMap<Window, LifecycleEntry>,
}

impl WindowManager {
    pub fn new(
        spec: WindowSpec,
        grace: Duration,
        retention: Duration,
        watermarks: Arc<Mutex<PartitionWatermarks>>,
    ) -> Self {
        Self {
            spec,
            grace,
            retention,
            watermarks,
            lifecycle: FxHashMap::default(),
        }
    }

    /// Assign an event to its window(s), registering new windows as OPEN.
    ///
    /// Rejects null-key events and events that are behind
    /// `watermark - grace` or target an already-closed window.
    pub fn assign(&mut self, event: &Event) -> Result<SmallVec<[Window; 4]>, EngineError> {
        let key = event.key.clone().ok_or(EngineError::NullKeyEvent {
            partition: event.partition,
            offset: event.offset,
        })?;

        let wm = self
            .watermarks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .watermark(event.partition);
        if let Some(wm) = wm {
            if event.event_time < wm - self.grace {
                return Err(EngineError::LateEvent {
                    key,
                    event_time: event.event_time,
                    watermark: wm,
                });
            }
        }

        let mut windows = SmallVec::new();
        for (start, end) in self.spec.ranges_for(event.event_time) {
            let window = Window::new(key.clone(), start, end);
            match self.lifecycle.get(&window).map(|e| e.state) {
                Some(WindowState::Closed) | Some(WindowState::Evicted) => {
                    return Err(EngineError::LateEvent {
                        key,
                        event_time: event.event_time,
                        watermark: wm.unwrap_or(event.event_time),
                    });
                }
                Some(_) => {}
                None => {
                    trace!(key = %window.key, start = %window.start, "opening window");
                    self.lifecycle.insert(
                        window.clone(),
                        LifecycleEntry {
                            state: WindowState::Open,
                            partition: event.partition,
                        },
                    );
                }
            }
            windows.push(window);
        }
        Ok(windows)
    }

    /// Observe an event time, advancing the partition's watermark.
    ///
    /// Returns the new watermark when it moved.
    pub fn advance_watermark(
        &mut self,
        partition: u32,
        event_time: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.watermarks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .observe(partition, event_time)
    }

    /// Current watermark for a partition.
    pub fn watermark(&self, partition: u32) -> Option<DateTime<Utc>> {
        self.watermarks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .watermark(partition)
    }

    /// Lowest watermark across all partitions.
    pub fn min_watermark(&self) -> Option<DateTime<Utc>> {
        self.watermarks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .min_watermark()
    }

    /// Advance every window's lifecycle against its partition's watermark.
    ///
    /// Returns transitions in ascending window order, one entry per state
    /// hop, so a window overtaken by a large watermark jump still reports
    /// CLOSING before CLOSED before EVICTED.
    pub fn tick(&mut self) -> Vec<(Window, WindowTransition)> {
        let mut transitions = Vec::new();
        let mut evicted = Vec::new();

        let watermarks = self.watermarks.lock().unwrap_or_else(|e| e.into_inner());
        for (window, entry) in self.lifecycle.iter_mut() {
            let Some(wm) = watermarks.watermark(entry.partition) else {
                continue;
            };

            let target = if wm >= window.end + self.grace + self.retention {
                WindowState::Evicted
            } else if wm >= window.end + self.grace {
                WindowState::Closed
            } else if wm >= window.end {
                WindowState::Closing
            } else {
                WindowState::Open
            };

            while entry.state < target {
                let (next, transition) = match entry.state {
                    WindowState::Open => (WindowState::Closing, WindowTransition::Closing),
                    WindowState::Closing => (WindowState::Closed, WindowTransition::Closed),
                    WindowState::Closed => (WindowState::Evicted, WindowTransition::Evicted),
                    WindowState::Evicted => break,
                };
                entry.state = next;
                transitions.push((window.clone(), transition));
            }

            if entry.state == WindowState::Evicted {
                evicted.push(window.clone());
            }
        }

        drop(watermarks);
        for window in evicted {
            debug!(key = %window.key, start = %window.start, "evicting window");
            self.lifecycle.remove(&window);
        }

        transitions.sort_by(|(a, ta), (b, tb)| a.cmp(b).then(transition_rank(*ta).cmp(&transition_rank(*tb))));
        transitions
    }

    /// Lifecycle state of a window, if tracked.
    pub fn state(&self, window: &Window) -> Option<WindowState> {
        self.lifecycle.get(window).map(|e| e.state)
    }

    /// Live windows and their owning partitions, sorted, for the snapshot
    /// blob.
    pub fn capture_windows(&self) -> Vec<(Window, u32)> {
        let mut windows: Vec<(Window, u32)> = self
            .lifecycle
            .iter()
            .map(|(window, entry)| (window.clone(), entry.partition))
            .collect();
        windows.sort_by(|(a, _), (b, _)| a.key.cmp(&b.key).then(a.cmp(b)));
        windows
    }

    /// Re-register windows as OPEN after a restore. The first tick against
    /// the restored watermarks walks each one forward to its real state,
    /// re-finalizing along the way; the publisher suppresses the resulting
    /// no-op writes.
    pub fn restore_windows(&mut self, windows: impl IntoIterator<Item = (Window, u32)>) {
        for (window, partition) in windows {
            self.lifecycle.entry(window).or_insert(LifecycleEntry {
                state: WindowState::Open,
                partition,
            });
        }
    }
}

fn transition_rank(t: WindowTransition) -> u8 {
    match t {
        WindowTransition::Closing => 0,
        WindowTransition::Closed => 1,
        WindowTransition::Evicted => 2,
    }
}
