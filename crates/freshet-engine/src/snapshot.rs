//! Snapshot capture and file-backed persistence.
//!
//! A snapshot is a versioned JSON blob holding every live store entry, the
//! per-partition watermarks, and the committed ingest cursors at capture
//! time. Restoring one is sufficient to resume processing without replaying
//! the log from the origin; events between the snapshot's cursors and the log
//! head are redelivered and must re-apply cleanly (idempotent finalize,
//! last-write-wins table state).
//!
//! [`SnapshotStore`] writes blobs atomically (temp file then rename) and
//! prunes old ones past a configured keep count.

use crate::error::EngineError;
use crate::store::{LatestEntry, WindowedEntry};
use crate::watermark::WatermarkEntry;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const SNAPSHOT_VERSION: u32 = 1;

/// A committed ingest cursor at capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorEntry {
    pub partition: u32,
    pub offset: u64,
}

/// An in-flight window accumulator at capture time. Without these, events
/// folded before the snapshot but into windows not yet closed would be lost
/// on restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorEntry {
    pub key: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub partition: u32,
    pub count: u64,
    pub sum: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Full engine state at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub watermarks: Vec<WatermarkEntry>,
    pub cursors: Vec<CursorEntry>,
    pub latest: Vec<LatestEntry>,
    pub windowed: Vec<WindowedEntry>,
    pub accumulators: Vec<AccumulatorEntry>,
}

impl Snapshot {
    pub fn new(
        watermarks: Vec<WatermarkEntry>,
        cursors: Vec<CursorEntry>,
        latest: Vec<LatestEntry>,
        windowed: Vec<WindowedEntry>,
        accumulators: Vec<AccumulatorEntry>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            taken_at: Utc::now(),
            watermarks,
            cursors,
            latest,
            windowed,
            accumulators,
        }
    }

    /// Serialize to the opaque wire form.
    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(self).map_err(|e| EngineError::CorruptSnapshot(e.to_string()))
    }

    /// Parse and validate a blob. Unknown versions and malformed JSON are
    /// both corrupt, a fatal condition.
    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        let snapshot: Snapshot = serde_json::from_slice(bytes)
            .map_err(|e| EngineError::CorruptSnapshot(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(EngineError::CorruptSnapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}

/// Directory of timestamped snapshot files.
pub struct SnapshotStore {
    dir: PathBuf,
    keep: usize,
}

impl SnapshotStore {
    /// `keep` bounds how many snapshots survive pruning (at least 1).
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            dir: dir.into(),
            keep: keep.max(1),
        }
    }

    /// Persist a snapshot atomically and prune old ones.
    pub fn write(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating snapshot dir {}", self.dir.display()))?;

        let name = format!("snapshot-{}.json", snapshot.taken_at.timestamp_millis());
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!("{name}.tmp"));

        let bytes = snapshot.encode()?;
        fs::write(&tmp, &bytes).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("committing {}", path.display()))?;
        info!(path = %path.display(), entries = snapshot.latest.len() + snapshot.windowed.len(), "snapshot written");

        self.prune()?;
        Ok(path)
    }

    /// Load the newest snapshot, if any exist.
    pub fn load_latest(&self) -> Result<Option<Snapshot>> {
        let Some(path) = self.list()?.pop() else {
            return Ok(None);
        };
        let bytes =
            fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let snapshot = Snapshot::decode(&bytes)
            .with_context(|| format!("decoding {}", path.display()))?;
        Ok(Some(snapshot))
    }

    /// Snapshot paths, oldest first.
    fn list(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)
            .with_context(|| format!("listing {}", self.dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| is_snapshot_file(path))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn prune(&self) -> Result<()> {
        let paths = self.list()?;
        if paths.len() <= self.keep {
            return Ok(());
        }
        for stale in &paths[..paths.len() - self.keep] {
            debug!(path = %stale.display(), "pruning snapshot");
            fs::remove_file(stale)
                .with_context(|| format!("pruning {}", stale.display()))?;
        }
        Ok(())
    }
}

fn is_snapshot_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("snapshot-"))
}
