//! Materialized view change publication.
//!
//! The publisher sits between the state store and the fanout: every store
//! mutation is diffed, stamped with a per-key monotonically increasing
//! sequence number, and forwarded. A write that does not change the stored
//! value emits nothing, so the publish path is idempotent under replay.
//!
//! The publisher holds no references into store internals; it receives the
//! old and new values at mutation time and owns only the per-key sequence
//! counters.

use crate::event::Key;
use crate::fanout::Fanout;
use crate::window::Window;
use chrono::{DateTime, Utc};
use freshet_core::Value;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// An ordered change to the materialized view for one key.
///
/// `sequence` is strictly increasing per key with no duplicates; no ordering
/// holds across distinct keys.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeNotification {
    pub key: Key,
    /// The window whose result changed, absent for latest-slot mutations.
    pub window: Option<Window>,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub sequence: u64,
    pub observed_at: DateTime<Utc>,
}

/// Diffs store mutations into [`ChangeNotification`]s and forwards them.
pub struct ViewPublisher {
    fanout: Arc<Fanout>,
    sequences: Mutex<FxHashMap<Key, u64>>,
}

impl ViewPublisher {
    pub fn new(fanout: Arc<Fanout>) -> Self {
        Self {
            fanout,
            sequences: Mutex::new(FxHashMap::default()),
        }
    }

    /// Publish one store mutation.
    ///
    /// Returns the stamped notification, or `None` for a no-op write
    /// (`old == new`), which is suppressed.
    pub fn on_store_mutation(
        &self,
        key: &Key,
        window: Option<&Window>,
        old_value: Option<Value>,
        new_value: Option<Value>,
    ) -> Option<ChangeNotification> {
        if old_value == new_value {
            trace!(key = %key, "no-op write suppressed");
            return None;
        }

        let sequence = {
            let mut sequences = self.sequences.lock().unwrap_or_else(|e| e.into_inner());
            let next = sequences.entry(key.clone()).or_insert(0);
            *next += 1;
            *next
        };

        let notification = ChangeNotification {
            key: key.clone(),
            window: window.cloned(),
            old_value,
            new_value,
            sequence,
            observed_at: Utc::now(),
        };
        self.fanout.deliver(&notification);
        Some(notification)
    }

    /// Last sequence stamped for a key, if any change was published.
    pub fn last_sequence(&self, key: &str) -> Option<u64> {
        self.sequences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::KeyFilter;
    use chrono::TimeZone;

    fn publisher() -> (ViewPublisher, Arc<Fanout>) {
        let fanout = Arc::new(Fanout::new(16, 8, crate::metrics::Metrics::new()));
        (ViewPublisher::new(fanout.clone()), fanout)
    }

    #[test]
    fn test_sequences_increase_per_key() {
        let (publisher, _fanout) = publisher();
        let key: Key = "A".into();

        let first = publisher
            .on_store_mutation(&key, None, None, Some(Value::Int(1)))
            .unwrap();
        let second = publisher
            .on_store_mutation(&key, None, Some(Value::Int(1)), Some(Value::Int(2)))
            .unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(publisher.last_sequence("A"), Some(2));
    }

    #[test]
    fn test_keys_have_independent_sequences() {
        let (publisher, _fanout) = publisher();

        let a = publisher
            .on_store_mutation(&"A".into(), None, None, Some(Value::Int(1)))
            .unwrap();
        let b = publisher
            .on_store_mutation(&"B".into(), None, None, Some(Value::Int(1)))
            .unwrap();

        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 1);
    }

    #[test]
    fn test_noop_write_suppressed() {
        let (publisher, _fanout) = publisher();
        let key: Key = "A".into();

        let suppressed =
            publisher.on_store_mutation(&key, None, Some(Value::Int(1)), Some(Value::Int(1)));
        assert!(suppressed.is_none());
        assert_eq!(publisher.last_sequence("A"), None);
    }

    #[tokio::test]
    async fn test_forwarded_to_fanout_with_window() {
        use crate::fanout::Frame;

        let (publisher, fanout) = publisher();
        let sub = fanout.subscribe(KeyFilter::All);

        let start = Utc.timestamp_opt(0, 0).unwrap();
        let end = Utc.timestamp_opt(60, 0).unwrap();
        let window = Window::new("A", start, end);

        publisher.on_store_mutation(
            &"A".into(),
            Some(&window),
            None,
            Some(Value::Int(7)),
        );

        let Some(Frame::Change(n)) = sub.next().await else {
            panic!("expected change frame");
        };
        assert_eq!(n.window, Some(window));
        assert_eq!(n.new_value, Some(Value::Int(7)));
    }
}
