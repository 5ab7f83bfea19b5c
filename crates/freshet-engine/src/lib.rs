//! Freshet Engine - windowed stream-join and materialized-view engine
//!
//! This crate ingests ordered, partitioned event streams, computes
//! time-windowed joins and rolling aggregations keyed by a join key,
//! maintains the results in a queryable state store, and pushes incremental
//! changes to live subscribers.

pub mod aggregate;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod fanout;
pub mod ingest;
pub mod join;
pub mod metrics;
pub mod publish;
pub mod quarantine;
pub mod query;
pub mod snapshot;
pub mod store;
pub mod watermark;
pub mod window;
pub mod worker;

pub use aggregate::{AggregateResult, Aggregator};
pub use config::{EngineConfig, JoinConfig};
pub use engine::{Engine, EngineStats};
pub use error::EngineError;
pub use event::{Event, Key};
pub use fanout::{Fanout, Frame, KeyFilter, SubscriberStats, Subscription};
pub use ingest::{IngestAdapter, IngestItem, MemoryAdapter};
pub use join::{JoinEngine, JoinKind, JoinMode, JoinOutcome, JoinSide, JoinedRecord};
pub use metrics::Metrics;
pub use publish::{ChangeNotification, ViewPublisher};
pub use quarantine::Quarantine;
pub use query::{QueryResponse, QueryService};
pub use snapshot::{CursorEntry, Snapshot, SnapshotStore};
pub use store::StateStore;
pub use watermark::PartitionWatermarks;
pub use window::{Window, WindowManager, WindowSpec, WindowState, WindowTransition};
