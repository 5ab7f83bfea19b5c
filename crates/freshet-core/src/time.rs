//! Event-time helpers.
//!
//! Freshet does all window arithmetic at millisecond precision. Timestamps are
//! `chrono::DateTime<Utc>` at the API surface and `i64` milliseconds since the
//! UNIX epoch internally.

use chrono::{DateTime, Utc};

/// Milliseconds since the UNIX epoch (UTC).
pub type TimestampMs = i64;

/// Convert a `DateTime<Utc>` to epoch milliseconds.
pub fn to_millis(ts: DateTime<Utc>) -> TimestampMs {
    ts.timestamp_millis()
}

/// Convert epoch milliseconds back to a `DateTime<Utc>`.
///
/// Falls back to the epoch for out-of-range inputs rather than panicking.
pub fn from_millis(ms: TimestampMs) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Floor division for i64 (unlike `/`, which truncates toward zero).
///
/// Needed so pre-epoch timestamps land in the correct window.
pub fn div_floor(a: i64, b: i64) -> i64 {
    let q = a / b;
    let r = a % b;
    if r != 0 && (r > 0) != (b > 0) {
        q - 1
    } else {
        q
    }
}
