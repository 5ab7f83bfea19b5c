//! Engine configuration.
//!
//! The grace period and the subscriber overflow-disconnect threshold are
//! tunable rather than hard-coded; no single default suits every deployment.

use crate::join::{JoinKind, JoinMode, JoinSide};
use crate::window::WindowSpec;
use chrono::Duration;
use rustc_hash::FxHashSet;

/// Configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Windowing scheme for the aggregation path.
    pub window: WindowSpec,
    /// Allowed out-of-orderness: watermark = max event time - this.
    pub out_of_orderness: Duration,
    /// Extra time after a window's nominal close during which late events may
    /// still update its result.
    pub grace: Duration,
    /// How long a closed window's result is retained before eviction.
    pub retention: Duration,
    /// Payload field folded by the aggregator.
    pub aggregate_field: String,
    /// Join topology, if any.
    pub join: Option<JoinConfig>,
    /// Bound on each subscriber's delivery queue.
    pub subscriber_queue_depth: usize,
    /// Cumulative overflows after which a subscription is terminated.
    pub overflow_disconnect_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window: WindowSpec::tumbling(Duration::seconds(60)),
            out_of_orderness: Duration::seconds(5),
            grace: Duration::seconds(10),
            retention: Duration::minutes(10),
            aggregate_field: "value".to_string(),
            join: None,
            subscriber_queue_depth: 256,
            overflow_disconnect_threshold: 16,
        }
    }
}

/// Join topology selection, dispatched as a tagged variant rather than a
/// class hierarchy.
#[derive(Debug, Clone)]
pub struct JoinConfig {
    pub kind: JoinKind,
    pub mode: JoinMode,
    /// Stream-stream only: an event matches buffered events of the other side
    /// within `±join_window` of its timestamp.
    pub join_window: Duration,
    /// Partitions carrying the right side of the join; everything else is the
    /// left (primary) stream.
    pub right_partitions: FxHashSet<u32>,
    /// Global-table joins: payload field of the left event holding the lookup
    /// key, when it differs from the stream's partitioning key.
    pub foreign_key_field: Option<String>,
}

impl JoinConfig {
    pub fn stream_stream(join_window: Duration) -> Self {
        Self {
            kind: JoinKind::StreamStream,
            mode: JoinMode::Inner,
            join_window,
            right_partitions: FxHashSet::default(),
            foreign_key_field: None,
        }
    }

    pub fn stream_table(mode: JoinMode) -> Self {
        Self {
            kind: JoinKind::StreamTable,
            mode,
            join_window: Duration::zero(),
            right_partitions: FxHashSet::default(),
            foreign_key_field: None,
        }
    }

    pub fn stream_global_table(mode: JoinMode, foreign_key_field: impl Into<String>) -> Self {
        Self {
            kind: JoinKind::StreamGlobalTable,
            mode,
            join_window: Duration::zero(),
            right_partitions: FxHashSet::default(),
            foreign_key_field: Some(foreign_key_field.into()),
        }
    }

    pub fn with_right_partitions(mut self, partitions: impl IntoIterator<Item = u32>) -> Self {
        self.right_partitions = partitions.into_iter().collect();
        self
    }

    /// Which side of the join a partition feeds.
    pub fn side_of(&self, partition: u32) -> JoinSide {
        if self.right_partitions.contains(&partition) {
            JoinSide::Right
        } else {
            JoinSide::Left
        }
    }
}
