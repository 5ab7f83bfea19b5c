//! Engine assembly and lifecycle.
//!
//! [`Engine`] owns the shared pipeline pieces, spawns one
//! [`PartitionWorker`](crate::worker::PartitionWorker) task per assigned
//! partition, and exposes the query, subscription, and snapshot surfaces.
//! Snapshot and restore require a quiesced engine; both refuse to run while
//! workers are live.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fanout::{Fanout, KeyFilter, Subscription};
use crate::ingest::IngestAdapter;
use crate::join::JoinEngine;
use crate::metrics::Metrics;
use crate::publish::ViewPublisher;
use crate::quarantine::Quarantine;
use crate::query::QueryService;
use crate::aggregate::AggregateResult;
use crate::snapshot::{AccumulatorEntry, CursorEntry, Snapshot};
use crate::watermark::PartitionWatermarks;
use crate::window::Window;
use crate::store::StateStore;
use crate::worker::{PartitionWorker, PipelineCore, WorkerContext};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// A windowed stream-join and materialized-view engine instance.
pub struct Engine {
    config: Arc<EngineConfig>,
    adapter: Arc<dyn IngestAdapter>,
    store: Arc<StateStore>,
    watermarks: Arc<Mutex<PartitionWatermarks>>,
    /// One windowing core per partition; a core is locked only by its own
    /// worker while the engine runs.
    cores: Mutex<FxHashMap<u32, Arc<Mutex<PipelineCore>>>>,
    join: Option<Arc<Mutex<JoinEngine>>>,
    fanout: Arc<Fanout>,
    publisher: Arc<ViewPublisher>,
    quarantine: Option<Arc<Quarantine>>,
    cursors: Arc<Mutex<FxHashMap<u32, u64>>>,
    metrics: Metrics,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<Result<(), EngineError>>>>,
    running: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig, adapter: Arc<dyn IngestAdapter>) -> Self {
        let config = Arc::new(config);
        let metrics = Metrics::new();
        let fanout = Arc::new(Fanout::new(
            config.subscriber_queue_depth,
            config.overflow_disconnect_threshold,
            metrics.clone(),
        ));
        let join = config
            .join
            .clone()
            .map(|j| Arc::new(Mutex::new(JoinEngine::new(j, Arc::new(StateStore::new())))));
        let (shutdown, _) = watch::channel(false);

        Self {
            watermarks: Arc::new(Mutex::new(PartitionWatermarks::new(
                config.out_of_orderness,
            ))),
            cores: Mutex::new(FxHashMap::default()),
            config,
            adapter,
            store: Arc::new(StateStore::new()),
            join,
            publisher: Arc::new(ViewPublisher::new(fanout.clone())),
            fanout,
            quarantine: None,
            cursors: Arc::new(Mutex::new(FxHashMap::default())),
            metrics,
            shutdown,
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Route rejected events to a quarantine file.
    pub fn with_quarantine(mut self, quarantine: Arc<Quarantine>) -> Self {
        self.quarantine = Some(quarantine);
        self
    }

    fn core_for(&self, partition: u32) -> Arc<Mutex<PipelineCore>> {
        self.cores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(partition)
            .or_insert_with(|| {
                Arc::new(Mutex::new(PipelineCore::new(
                    &self.config,
                    self.watermarks.clone(),
                )))
            })
            .clone()
    }

    fn worker_context(&self, partition: u32) -> WorkerContext {
        WorkerContext {
            config: self.config.clone(),
            adapter: self.adapter.clone(),
            core: self.core_for(partition),
            join: self.join.clone(),
            store: self.store.clone(),
            publisher: self.publisher.clone(),
            quarantine: self.quarantine.clone(),
            cursors: self.cursors.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Spawn one worker per assigned partition.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("engine already running");
            return;
        }
        let _ = self.shutdown.send(false);

        let partitions = self.adapter.partitions();
        info!(partitions = partitions.len(), "engine starting");
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for partition in partitions {
            let worker = PartitionWorker::new(
                partition,
                self.worker_context(partition),
                self.shutdown.subscribe(),
            );
            workers.push(tokio::spawn(worker.run()));
        }
    }

    /// Await all workers draining their partitions (end-of-partition).
    pub async fn wait(&self) -> Result<(), EngineError> {
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        let mut result = Ok(());
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => result = Err(err),
                Err(join_err) => {
                    result = Err(EngineError::AdapterFailed(format!(
                        "worker task failed: {join_err}"
                    )))
                }
            }
        }
        self.running.store(false, Ordering::Release);
        result
    }

    /// Signal shutdown and await the workers.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let _ = self.shutdown.send(true);
        self.wait().await
    }

    /// Register a push subscriber.
    pub fn subscribe(&self, filter: KeyFilter) -> Subscription {
        let subscription = self.fanout.subscribe(filter);
        self.metrics
            .subscribers
            .set(self.fanout.subscriber_count() as f64);
        subscription
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.fanout.unsubscribe(id);
        self.metrics
            .subscribers
            .set(self.fanout.subscriber_count() as f64);
    }

    /// Read-only store facade.
    pub fn query(&self) -> QueryService {
        QueryService::new(self.store.clone())
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Point-in-time counters for operational visibility.
    pub fn stats(&self) -> EngineStats {
        let live_windows: usize = {
            let cores = self.cores.lock().unwrap_or_else(|e| e.into_inner());
            cores
                .values()
                .map(|core| {
                    core.lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .aggregator
                        .live_windows()
                })
                .sum()
        };
        EngineStats {
            store_entries: self.store.len(),
            live_windows,
            buffered_join_events: self
                .join
                .as_ref()
                .map(|j| j.lock().unwrap_or_else(|e| e.into_inner()).buffered())
                .unwrap_or(0),
            subscribers: self.fanout.subscriber_count(),
            quarantined: self.quarantine.as_ref().map(|q| q.count()).unwrap_or(0),
        }
    }

    /// Capture full engine state. Requires a quiesced engine.
    pub fn snapshot(&self) -> Result<Snapshot, EngineError> {
        if self.running.load(Ordering::Acquire) {
            return Err(EngineError::StoreUnavailable);
        }
        let watermarks = self
            .watermarks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .capture();
        let mut accumulators: Vec<AccumulatorEntry> = Vec::new();
        {
            let cores = self.cores.lock().unwrap_or_else(|e| e.into_inner());
            for core in cores.values() {
                let core = core.lock().unwrap_or_else(|e| e.into_inner());
                let partitions: FxHashMap<Window, u32> =
                    core.windows.capture_windows().into_iter().collect();
                for result in core.aggregator.capture() {
                    let Some(partition) = partitions.get(&result.window) else {
                        continue;
                    };
                    accumulators.push(AccumulatorEntry {
                        key: result.window.key.to_string(),
                        start_ms: result.window.start.timestamp_millis(),
                        end_ms: result.window.end.timestamp_millis(),
                        partition: *partition,
                        count: result.count,
                        sum: result.sum,
                        min: result.min,
                        max: result.max,
                    });
                }
            }
        }
        accumulators.sort_by(|a, b| {
            a.key
                .cmp(&b.key)
                .then(a.start_ms.cmp(&b.start_ms))
                .then(a.end_ms.cmp(&b.end_ms))
        });
        let mut cursors: Vec<CursorEntry> = self
            .cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(partition, offset)| CursorEntry {
                partition: *partition,
                offset: *offset,
            })
            .collect();
        cursors.sort_by_key(|c| c.partition);
        let (latest, windowed) = self.store.capture();
        Ok(Snapshot::new(
            watermarks,
            cursors,
            latest,
            windowed,
            accumulators,
        ))
    }

    /// Replace engine state from a snapshot and reposition the adapter just
    /// past its committed cursors. Requires a quiesced engine; the next
    /// [`Engine::start`] resumes from there.
    pub async fn restore(&self, snapshot: Snapshot) -> Result<(), EngineError> {
        if self.running.load(Ordering::Acquire) {
            return Err(EngineError::StoreUnavailable);
        }
        info!(
            watermarks = snapshot.watermarks.len(),
            entries = snapshot.latest.len() + snapshot.windowed.len(),
            "restoring from snapshot"
        );

        self.store.restore_from(snapshot.latest, snapshot.windowed);
        self.watermarks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .restore(&snapshot.watermarks);

        // Rebuild the per-partition cores from scratch.
        self.cores.lock().unwrap_or_else(|e| e.into_inner()).clear();
        let mut by_partition: FxHashMap<u32, (Vec<(Window, u32)>, Vec<AggregateResult>)> =
            FxHashMap::default();
        for entry in &snapshot.accumulators {
            let window = Window::new(
                entry.key.as_str(),
                chrono::DateTime::from_timestamp_millis(entry.start_ms).unwrap_or_default(),
                chrono::DateTime::from_timestamp_millis(entry.end_ms).unwrap_or_default(),
            );
            let (windows, results) = by_partition.entry(entry.partition).or_default();
            windows.push((window.clone(), entry.partition));
            results.push(AggregateResult {
                window,
                count: entry.count,
                sum: entry.sum,
                min: entry.min,
                max: entry.max,
            });
        }
        for (partition, (windows, results)) in by_partition {
            let core = self.core_for(partition);
            let mut core = core.lock().unwrap_or_else(|e| e.into_inner());
            core.windows.restore_windows(windows);
            core.aggregator.restore(results);
        }
        {
            let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
            cursors.clear();
            for cursor in &snapshot.cursors {
                cursors.insert(cursor.partition, cursor.offset);
            }
        }
        for cursor in &snapshot.cursors {
            // Committed offsets are fully applied; resume after them.
            self.adapter.seek(cursor.partition, cursor.offset + 1).await?;
        }
        Ok(())
    }
}

/// Operational counters reported by [`Engine::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub store_entries: usize,
    pub live_windows: usize,
    pub buffered_join_events: usize,
    pub subscribers: usize,
    pub quarantined: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::ingest::MemoryAdapter;
    use crate::query::QueryResponse;
    use crate::window::Window;
    use chrono::{Duration, TimeZone, Utc};
    use freshet_core::Value;

    fn event(partition: u32, offset: u64, key: &str, secs: i64, value: f64) -> Event {
        Event::new(partition, offset)
            .with_key(key)
            .with_value(value)
            .with_event_time(Utc.timestamp_opt(secs, 0).unwrap())
    }

    fn config() -> EngineConfig {
        EngineConfig {
            out_of_orderness: Duration::zero(),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_end_to_end_aggregation() {
        let adapter = Arc::new(MemoryAdapter::new());
        adapter.push(event(0, 0, "A", 10, 1.0));
        adapter.push(event(0, 1, "A", 40, 2.0));
        adapter.push(event(0, 2, "A", 200, 3.0));

        let engine = Engine::new(config(), adapter);
        engine.start();
        engine.wait().await.unwrap();

        let window = Window::new(
            "A",
            Utc.timestamp_opt(0, 0).unwrap(),
            Utc.timestamp_opt(60, 0).unwrap(),
        );
        let QueryResponse::Found(value) = engine.query().get_window(&window) else {
            panic!("window result missing");
        };
        assert_eq!(value.get("count"), Some(&Value::Int(2)));
        assert_eq!(value.get("min"), Some(&Value::Float(1.0)));
        assert_eq!(value.get("max"), Some(&Value::Float(2.0)));
    }

    #[tokio::test]
    async fn test_partitions_aggregate_independently() {
        let adapter = Arc::new(MemoryAdapter::new());
        adapter.push(event(0, 0, "A", 10, 1.0));
        adapter.push(event(0, 1, "A", 200, 0.0));
        adapter.push(event(1, 0, "B", 10, 5.0));
        adapter.push(event(1, 1, "B", 200, 0.0));

        let engine = Engine::new(config(), adapter);
        engine.start();
        engine.wait().await.unwrap();

        let query = engine.query();
        for (key, sum) in [("A", 1.0), ("B", 5.0)] {
            let window = Window::new(
                key,
                Utc.timestamp_opt(0, 0).unwrap(),
                Utc.timestamp_opt(60, 0).unwrap(),
            );
            let QueryResponse::Found(value) = query.get_window(&window) else {
                panic!("window for {key} missing");
            };
            assert_eq!(value.get("sum"), Some(&Value::Float(sum)));
        }
        // Both partition clocks end up in the snapshot.
        let snapshot = engine.snapshot().unwrap();
        assert_eq!(snapshot.watermarks.len(), 2);
    }

    #[tokio::test]
    async fn test_fast_partition_does_not_close_other_partitions_windows() {
        let adapter = Arc::new(MemoryAdapter::new());
        adapter.push(event(0, 0, "A", 10, 1.0));
        adapter.push(event(0, 1, "A", 600, 0.0));
        // Partition 1's watermark stays at 10; its window must stay open.
        adapter.push(event(1, 0, "B", 10, 5.0));

        let engine = Engine::new(config(), adapter);
        engine.start();
        engine.wait().await.unwrap();

        let start = Utc.timestamp_opt(0, 0).unwrap();
        let end = Utc.timestamp_opt(60, 0).unwrap();
        let query = engine.query();
        assert!(matches!(
            query.get_window(&Window::new("A", start, end)),
            QueryResponse::Found(_)
        ));
        assert_eq!(
            query.get_window(&Window::new("B", start, end)),
            QueryResponse::NotFound
        );
    }

    #[tokio::test]
    async fn test_snapshot_requires_quiesce() {
        let adapter = Arc::new(MemoryAdapter::new());
        adapter.push(event(0, 0, "A", 10, 1.0));
        let engine = Engine::new(config(), adapter);

        engine.start();
        let err = engine.snapshot().unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable));

        engine.wait().await.unwrap();
        assert!(engine.snapshot().is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_restore_resumes_past_cursor() {
        let adapter = Arc::new(MemoryAdapter::new());
        adapter.push(event(0, 0, "A", 10, 1.0));
        adapter.push(event(0, 1, "A", 200, 2.0));

        let engine = Engine::new(config(), adapter.clone());
        engine.start();
        engine.wait().await.unwrap();
        let snapshot = engine.snapshot().unwrap();
        assert_eq!(
            snapshot.cursors,
            vec![CursorEntry {
                partition: 0,
                offset: 1
            }]
        );

        // A fresh engine over the same adapter picks up only new events.
        adapter.push(event(0, 2, "A", 260, 3.0));
        let restored = Engine::new(config(), adapter);
        restored.restore(snapshot).await.unwrap();
        restored.start();
        restored.wait().await.unwrap();

        let window = Window::new(
            "A",
            Utc.timestamp_opt(0, 0).unwrap(),
            Utc.timestamp_opt(60, 0).unwrap(),
        );
        // Pre-snapshot state is still served.
        assert!(matches!(
            restored.query().get_window(&window),
            QueryResponse::Found(_)
        ));
    }

    #[tokio::test]
    async fn test_stats_and_subscribe() {
        let adapter = Arc::new(MemoryAdapter::new());
        let engine = Engine::new(config(), adapter);

        let sub = engine.subscribe(KeyFilter::All);
        assert_eq!(engine.stats().subscribers, 1);

        engine.unsubscribe(sub.id());
        assert_eq!(engine.stats().subscribers, 0);
    }
}
