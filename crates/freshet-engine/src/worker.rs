//! Per-partition processing workers.
//!
//! One worker runs per input partition, consuming its events strictly in
//! arrival order; this is what gives the per-key ordering guarantee, since a
//! key lives in exactly one partition. Workers run in parallel across
//! partitions: each owns the windowing core for its partition, and only the
//! watermark tracker, state store, join engine, and fanout are shared,
//! through the explicit [`WorkerContext`]; there is no ambient global state.
//!
//! Per event, effects apply in a fixed order: watermark advance, window
//! assignment and fold, lifecycle tick, store mutation, notification, and
//! only then the cursor commit. A crash between effect and commit redelivers
//! the event; every effect re-applies cleanly (idempotent finalize,
//! last-write-wins table state, no-op publish suppression).

use crate::aggregate::{AggregateResult, Aggregator};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::{Event, Key};
use crate::ingest::{IngestAdapter, IngestItem};
use crate::join::{JoinEngine, JoinOutcome, JoinSide};
use crate::metrics::Metrics;
use crate::publish::ViewPublisher;
use crate::quarantine::Quarantine;
use crate::store::StateStore;
use crate::watermark::PartitionWatermarks;
use crate::window::{Window, WindowManager, WindowState, WindowTransition};
use freshet_core::Value;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Windowing and aggregation state for one partition.
pub struct PipelineCore {
    pub windows: WindowManager,
    pub aggregator: Aggregator,
}

impl PipelineCore {
    /// `watermarks` is the tracker shared by every partition's core.
    pub fn new(config: &EngineConfig, watermarks: Arc<Mutex<PartitionWatermarks>>) -> Self {
        Self {
            windows: WindowManager::new(
                config.window,
                config.grace,
                config.retention,
                watermarks,
            ),
            aggregator: Aggregator::new(config.aggregate_field.clone()),
        }
    }
}

/// Everything a worker touches, passed explicitly.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<EngineConfig>,
    pub adapter: Arc<dyn IngestAdapter>,
    /// This partition's windowing core; no other worker locks it.
    pub core: Arc<Mutex<PipelineCore>>,
    pub join: Option<Arc<Mutex<JoinEngine>>>,
    pub store: Arc<StateStore>,
    pub publisher: Arc<ViewPublisher>,
    pub quarantine: Option<Arc<Quarantine>>,
    pub cursors: Arc<Mutex<FxHashMap<u32, u64>>>,
    pub metrics: Metrics,
}

/// Drives one partition until end-of-partition, shutdown, or a fatal error.
pub struct PartitionWorker {
    partition: u32,
    ctx: WorkerContext,
    shutdown: watch::Receiver<bool>,
}

impl PartitionWorker {
    pub fn new(partition: u32, ctx: WorkerContext, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            partition,
            ctx,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<(), EngineError> {
        debug!(partition = self.partition, "worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let item = tokio::select! {
                _ = self.shutdown.changed() => break,
                item = self.ctx.adapter.next_event(self.partition) => item,
            };
            let item = match item {
                Ok(item) => item,
                Err(err) => {
                    error!(partition = self.partition, %err, "adapter failure");
                    return Err(err);
                }
            };

            match item {
                IngestItem::EndOfPartition => break,
                IngestItem::Malformed {
                    partition,
                    offset,
                    raw,
                    reason,
                } => {
                    let err = EngineError::MalformedEvent {
                        partition,
                        offset,
                        reason,
                    };
                    self.reject(&err, offset, Some(raw));
                    self.commit(offset).await?;
                }
                IngestItem::Event(event) => {
                    let offset = event.offset;
                    let started = Instant::now();
                    self.process(&event)?;
                    self.ctx
                        .metrics
                        .processing_latency
                        .with_label_values(&[&self.partition.to_string()])
                        .observe(started.elapsed().as_secs_f64());
                    self.commit(offset).await?;
                }
            }
        }
        debug!(partition = self.partition, "worker stopped");
        Ok(())
    }

    /// Apply one event's effects. Only fatal errors propagate; everything
    /// else is counted (and quarantined where applicable) locally.
    fn process(&self, event: &Event) -> Result<(), EngineError> {
        self.ctx.metrics.record_event(self.partition);

        let side = self
            .ctx
            .config
            .join
            .as_ref()
            .map(|j| j.side_of(self.partition))
            .unwrap_or(JoinSide::Left);

        let mut revisions: Vec<(Window, AggregateResult)> = Vec::new();
        let min_watermark;
        {
            let mut core = self.ctx.core.lock().unwrap_or_else(|e| e.into_inner());
            core.windows.advance_watermark(event.partition, event.event_time);

            // The aggregation path covers the primary (left) stream; table
            // and right-side stream events only feed the join.
            if side == JoinSide::Left {
                match core.windows.assign(event) {
                    Ok(windows) => {
                        for window in &windows {
                            core.aggregator.fold(event, window);
                            // A fold into a window past its nominal close is a
                            // late revision; republish immediately.
                            if core.windows.state(window) == Some(WindowState::Closing) {
                                if let Some(result) = core.aggregator.finalize(window) {
                                    revisions.push((window.clone(), result));
                                }
                            }
                        }
                    }
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => self.reject(&err, event.offset, payload_json(event)),
                }
            }

            let mut evicted: Vec<Window> = Vec::new();
            for (window, transition) in core.windows.tick() {
                match transition {
                    WindowTransition::Closing => {
                        self.ctx.metrics.record_transition("closing");
                        if let Some(result) = core.aggregator.finalize(&window) {
                            revisions.push((window, result));
                        }
                    }
                    WindowTransition::Closed => {
                        self.ctx.metrics.record_transition("closed");
                        // The result was published at CLOSING and revised on
                        // any late fold; a re-publish here is a no-op the
                        // publisher suppresses, so skip it.
                    }
                    WindowTransition::Evicted => {
                        self.ctx.metrics.record_transition("evicted");
                        core.aggregator.evict(&window);
                        evicted.push(window);
                    }
                }
            }
            // A watermark jump can take a window from OPEN to EVICTED in one
            // tick; its pending publish must not resurrect the store entry.
            if !evicted.is_empty() {
                revisions.retain(|(window, _)| !evicted.contains(window));
            }
            for window in &evicted {
                self.ctx.store.remove_window(window);
            }

            min_watermark = core.windows.min_watermark();
        }

        for (window, result) in revisions {
            self.materialize(&window, &result);
        }

        if let Some(join) = &self.ctx.join {
            let outcome = {
                let mut join = join.lock().unwrap_or_else(|e| e.into_inner());
                let outcome = join.process(event);
                if let Some(wm) = min_watermark {
                    join.evict_before(wm);
                }
                outcome
            };
            match outcome {
                Ok(JoinOutcome::Matched(record)) => {
                    self.ctx.metrics.join_matches_total.inc();
                    self.put_latest(&record.key, record.to_value());
                }
                Ok(JoinOutcome::Buffered) | Ok(JoinOutcome::TableUpdated) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => self.reject(&err, event.offset, payload_json(event)),
            }
        }

        Ok(())
    }

    /// Write a finalized window result and publish the diff.
    fn materialize(&self, window: &Window, result: &AggregateResult) {
        let new = result.to_value();
        match self.ctx.store.put_windowed(window, new.clone()) {
            Ok(old) => {
                if self
                    .ctx
                    .publisher
                    .on_store_mutation(&window.key, Some(window), old, Some(new))
                    .is_some()
                {
                    self.ctx.metrics.notifications_total.inc();
                }
            }
            Err(err) => {
                warn!(key = %window.key, %err, "windowed write failed");
                self.ctx.metrics.record_error(err.kind());
            }
        }
    }

    /// Write a latest-slot value and publish the diff.
    fn put_latest(&self, key: &Key, new: Value) {
        match self.ctx.store.put_latest(key, new.clone()) {
            Ok(old) => {
                if self
                    .ctx
                    .publisher
                    .on_store_mutation(key, None, old, Some(new))
                    .is_some()
                {
                    self.ctx.metrics.notifications_total.inc();
                }
            }
            Err(err) => {
                warn!(key = %key, %err, "latest write failed");
                self.ctx.metrics.record_error(err.kind());
            }
        }
    }

    /// Count a non-fatal rejection; quarantine the kinds that carry data.
    fn reject(&self, err: &EngineError, offset: u64, payload: Option<serde_json::Value>) {
        self.ctx.metrics.record_error(err.kind());
        let quarantined = matches!(
            err,
            EngineError::MalformedEvent { .. } | EngineError::NullKeyEvent { .. }
        );
        if quarantined {
            if let Some(quarantine) = &self.ctx.quarantine {
                quarantine.record(err, self.partition, offset, payload.as_ref());
            }
        }
        debug!(partition = self.partition, offset, kind = err.kind(), "event rejected");
    }

    /// Commit only after all effects above are in the store.
    async fn commit(&self, offset: u64) -> Result<(), EngineError> {
        self.ctx
            .adapter
            .commit_cursor(self.partition, offset)
            .await?;
        self.ctx
            .cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(self.partition, offset);
        Ok(())
    }
}

fn payload_json(event: &Event) -> Option<serde_json::Value> {
    serde_json::to_value(&event.value).ok()
}
