//! Rolling aggregation per key per window.
//!
//! The aggregator folds events into `count`/`sum`/`min`/`max` accumulators and
//! produces an immutable [`AggregateResult`] snapshot on finalize. The average
//! is computed at read time from `sum / count`, never stored, so the two can
//! not drift apart. `sum`/`min`/`max` are seeded from the first numeric value
//! rather than a sentinel; a window that sees no numeric values reports them
//! as null, and an empty window never materializes a result.
//!
//! `finalize` is idempotent: it snapshots the current accumulator without
//! consuming it, so a retried finalize after a timeout produces the same
//! result, and a late event within the grace period simply folds and
//! re-finalizes.

use crate::event::Event;
use crate::window::Window;
use freshet_core::Value;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Immutable aggregation snapshot for one `(key, window)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub window: Window,
    pub count: u64,
    pub sum: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl AggregateResult {
    /// `sum / count`, computed at read time.
    pub fn average(&self) -> Option<f64> {
        match (self.sum, self.count) {
            (Some(sum), count) if count > 0 => Some(sum / count as f64),
            _ => None,
        }
    }

    /// Encode as a generic store value.
    pub fn to_value(&self) -> Value {
        Value::map_from([
            ("count".to_string(), Value::Int(self.count as i64)),
            ("sum".to_string(), float_or_null(self.sum)),
            ("min".to_string(), float_or_null(self.min)),
            ("max".to_string(), float_or_null(self.max)),
        ])
    }
}

fn float_or_null(v: Option<f64>) -> Value {
    v.map(Value::Float).unwrap_or(Value::Null)
}

#[derive(Debug, Clone, PartialEq)]
struct Accumulator {
    count: u64,
    sum: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
}

/// Folds events into per-window accumulators.
pub struct Aggregator {
    field: String,
    state: FxHashMap<Window, Accumulator>,
}

impl Aggregator {
    /// `field` names the payload field to fold (bare numeric payloads work
    /// too, see [`Event::get_float`]).
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            state: FxHashMap::default(),
        }
    }

    /// Fold one event into one of its assigned windows.
    ///
    /// Events without a numeric value for the configured field are counted
    /// but contribute nothing to sum/min/max.
    pub fn fold(&mut self, event: &Event, window: &Window) {
        let value = event.get_float(&self.field);
        trace!(key = %window.key, start = %window.start, ?value, "fold");

        match self.state.get_mut(window) {
            Some(acc) => {
                acc.count += 1;
                if let Some(v) = value {
                    acc.sum = Some(acc.sum.unwrap_or(0.0) + v);
                    acc.min = Some(acc.min.map_or(v, |m| m.min(v)));
                    acc.max = Some(acc.max.map_or(v, |m| m.max(v)));
                }
            }
            None => {
                // Seed from the first numeric value, never a sentinel; a
                // window without numerics reports null sum/min/max.
                self.state.insert(
                    window.clone(),
                    Accumulator {
                        count: 1,
                        sum: value,
                        min: value,
                        max: value,
                    },
                );
            }
        }
    }

    /// Snapshot the current accumulator for a window.
    ///
    /// Returns `None` for a window that never received an event. Does not
    /// consume state, so repeated calls yield identical results.
    pub fn finalize(&self, window: &Window) -> Option<AggregateResult> {
        self.state.get(window).map(|acc| AggregateResult {
            window: window.clone(),
            count: acc.count,
            sum: acc.sum,
            min: acc.min,
            max: acc.max,
        })
    }

    /// Drop accumulator state for an evicted window.
    pub fn evict(&mut self, window: &Window) {
        self.state.remove(window);
    }

    /// Number of windows currently holding state.
    pub fn live_windows(&self) -> usize {
        self.state.len()
    }

    /// Snapshot every live accumulator, sorted by window.
    pub fn capture(&self) -> Vec<AggregateResult> {
        let mut results: Vec<AggregateResult> = self
            .state
            .iter()
            .map(|(window, acc)| AggregateResult {
                window: window.clone(),
                count: acc.count,
                sum: acc.sum,
                min: acc.min,
                max: acc.max,
            })
            .collect();
        results.sort_by(|a, b| a.window.key.cmp(&b.window.key).then(a.window.cmp(&b.window)));
        results
    }

    /// Re-seed accumulators from captured results (restore path).
    pub fn restore(&mut self, results: Vec<AggregateResult>) {
        self.state.clear();
        for result in results {
            self.state.insert(
                result.window,
                Accumulator {
                    count: result.count,
                    sum: result.sum,
                    min: result.min,
                    max: result.max,
                },
            );
        }
    }
}
