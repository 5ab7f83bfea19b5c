//! Quarantine for events rejected by the pipeline.
//!
//! Malformed, null-key, and too-late events are never silently dropped: they
//! are appended as one JSON line each to a quarantine file, tagged with the
//! error kind that rejected them, and counted. The worker keeps processing.

use crate::error::EngineError;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A quarantined event with rejection metadata.
#[derive(serde::Serialize)]
struct QuarantineEntry<'a> {
    /// ISO-8601 timestamp when the event was quarantined.
    timestamp: String,
    /// Stable error kind label, see [`EngineError::kind`].
    kind: &'a str,
    /// Human-readable rejection reason.
    reason: String,
    partition: u32,
    offset: u64,
    /// Raw payload as received, when still available.
    payload: Option<&'a serde_json::Value>,
}

/// File-backed quarantine, one JSON line per rejected event.
///
/// Thread-safe via an internal mutex on the file handle.
pub struct Quarantine {
    file: Mutex<File>,
    path: PathBuf,
    /// Total events quarantined.
    pub events_total: AtomicU64,
}

impl Quarantine {
    /// Open (or create) the quarantine file at the given path.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
            events_total: AtomicU64::new(0),
        })
    }

    /// Record one rejected event.
    pub fn record(
        &self,
        error: &EngineError,
        partition: u32,
        offset: u64,
        payload: Option<&serde_json::Value>,
    ) {
        let entry = QuarantineEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            kind: error.kind(),
            reason: error.to_string(),
            partition,
            offset,
            payload,
        };

        if let Ok(line) = serde_json::to_string(&entry) {
            let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
            // Best-effort: a quarantine write failure never stalls the worker.
            if writeln!(file, "{}", line).is_ok() {
                self.events_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Path to the quarantine file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of events quarantined so far.
    pub fn count(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }
}
