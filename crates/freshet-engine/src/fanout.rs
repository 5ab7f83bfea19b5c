//! Push fanout to live subscribers.
//!
//! Every subscriber owns a bounded delivery queue; the publisher never blocks
//! on a slow consumer. When a queue is full the oldest undelivered change is
//! dropped and a `Gap` frame for its key takes its place, telling the client
//! to re-fetch that key through the query service. Gaps for the same key
//! coalesce. A subscriber whose cumulative overflow count crosses the
//! configured threshold has its subscription terminated.
//!
//! Per-key frame order is preserved because each key is mutated by exactly
//! one partition worker and the queue is FIFO; a gap for a key is always
//! delivered before any change newer than the drop.

use crate::error::EngineError;
use crate::event::Key;
use crate::metrics::Metrics;
use crate::publish::ChangeNotification;
use indexmap::IndexSet;
use rustc_hash::{FxBuildHasher, FxHashMap};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// A frame pushed to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Frame {
    /// An ordered change for a key the subscription covers.
    Change(ChangeNotification),
    /// A change for this key was dropped; re-fetch via the query service.
    Gap { key: Key },
}

/// Which keys a subscription covers.
#[derive(Debug, Clone)]
pub enum KeyFilter {
    All,
    Keys(rustc_hash::FxHashSet<Key>),
    Prefix(String),
}

impl KeyFilter {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyFilter::All => true,
            KeyFilter::Keys(keys) => keys.contains(key),
            KeyFilter::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

#[derive(Default)]
struct DeliveryState {
    queue: VecDeque<Frame>,
    /// Keys with a pending gap, served before queued frames.
    gaps: IndexSet<Key, FxBuildHasher>,
}

struct SubscriberState {
    filter: KeyFilter,
    delivery: Mutex<DeliveryState>,
    notify: Notify,
    closed: AtomicBool,
    overflows: AtomicU32,
    delivered: AtomicU64,
}

impl SubscriberState {
    fn try_pop(&self) -> Option<Frame> {
        let mut delivery = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(key) = delivery.gaps.shift_remove_index(0) {
            return Some(Frame::Gap { key });
        }
        delivery.queue.pop_front()
    }
}

/// A live subscription handle. Frames arrive through [`Subscription::next`];
/// `None` means the subscription ended (unsubscribe or termination).
pub struct Subscription {
    id: Uuid,
    state: Arc<SubscriberState>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Await the next frame, in per-key order.
    pub async fn next(&self) -> Option<Frame> {
        loop {
            let notified = self.state.notify.notified();
            if let Some(frame) = self.state.try_pop() {
                self.state.delivered.fetch_add(1, Ordering::Relaxed);
                return Some(frame);
            }
            if self.state.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Frames received so far and overflows suffered.
    pub fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            delivered: self.state.delivered.load(Ordering::Relaxed),
            overflows: self.state.overflows.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberStats {
    pub delivered: u64,
    pub overflows: u32,
}

/// Subscriber registry and delivery dispatch.
pub struct Fanout {
    subscribers: RwLock<FxHashMap<Uuid, Arc<SubscriberState>>>,
    queue_depth: usize,
    overflow_threshold: u32,
    metrics: Metrics,
}

impl Fanout {
    pub fn new(queue_depth: usize, overflow_threshold: u32, metrics: Metrics) -> Self {
        Self {
            subscribers: RwLock::new(FxHashMap::default()),
            queue_depth: queue_depth.max(1),
            overflow_threshold: overflow_threshold.max(1),
            metrics,
        }
    }

    /// Register a subscriber covering the filtered keys.
    pub fn subscribe(&self, filter: KeyFilter) -> Subscription {
        let id = Uuid::new_v4();
        let state = Arc::new(SubscriberState {
            filter,
            delivery: Mutex::new(DeliveryState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            overflows: AtomicU32::new(0),
            delivered: AtomicU64::new(0),
        });
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, state.clone());
        debug!(%id, "subscriber registered");
        Subscription { id, state }
    }

    /// Remove a subscriber; its pending frames are discarded.
    pub fn unsubscribe(&self, id: Uuid) {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if let Some(state) = removed {
            state.closed.store(true, Ordering::Release);
            state.notify.notify_one();
            debug!(%id, "subscriber removed");
        }
    }

    /// Dispatch a notification to every matching subscriber.
    ///
    /// Returns how many subscribers the frame was enqueued for.
    pub fn deliver(&self, notification: &ChangeNotification) -> usize {
        let mut terminated = Vec::new();
        let mut enqueued = 0;
        {
            let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            for (id, state) in subscribers.iter() {
                if state.closed.load(Ordering::Acquire)
                    || !state.filter.matches(&notification.key)
                {
                    continue;
                }
                if self.offer(id, state, notification) {
                    enqueued += 1;
                } else {
                    terminated.push(*id);
                }
            }
        }
        for id in terminated {
            self.unsubscribe(id);
        }
        enqueued
    }

    /// Enqueue one frame; full queues drop their oldest change for a gap.
    /// Returns false when the overflow threshold terminates the subscription.
    fn offer(&self, id: &Uuid, state: &SubscriberState, notification: &ChangeNotification) -> bool {
        let mut delivery = state.delivery.lock().unwrap_or_else(|e| e.into_inner());

        if delivery.queue.len() >= self.queue_depth {
            if let Some(dropped) = delivery.queue.pop_front() {
                let key = match dropped {
                    Frame::Change(n) => n.key,
                    Frame::Gap { key } => key,
                };
                let err = EngineError::SubscriberOverflow {
                    subscriber: *id,
                    key: key.clone(),
                };
                self.metrics.record_error(err.kind());
                debug!(%err, "change dropped for gap");
                if delivery.gaps.insert(key) {
                    self.metrics.gap_frames_total.inc();
                }
            }
            let overflows = state.overflows.fetch_add(1, Ordering::Relaxed) + 1;
            if overflows >= self.overflow_threshold {
                warn!(%id, overflows, "subscriber overflow threshold reached, terminating");
                delivery.queue.clear();
                delivery.gaps.clear();
                state.closed.store(true, Ordering::Release);
                state.notify.notify_one();
                return false;
            }
        }

        delivery.queue.push_back(Frame::Change(notification.clone()));
        drop(delivery);
        state.notify.notify_one();
        true
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use freshet_core::Value;

    fn notification(key: &str, sequence: u64) -> ChangeNotification {
        ChangeNotification {
            key: key.into(),
            window: None,
            old_value: None,
            new_value: Some(Value::Int(sequence as i64)),
            sequence,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_delivery_in_order() {
        let fanout = Fanout::new(8, 4, Metrics::new());
        let sub = fanout.subscribe(KeyFilter::All);

        fanout.deliver(&notification("A", 1));
        fanout.deliver(&notification("A", 2));

        let Some(Frame::Change(first)) = sub.next().await else {
            panic!("expected change");
        };
        let Some(Frame::Change(second)) = sub.next().await else {
            panic!("expected change");
        };
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
    }

    #[tokio::test]
    async fn test_key_filter() {
        let fanout = Fanout::new(8, 4, Metrics::new());
        let sub = fanout.subscribe(KeyFilter::Prefix("orders-".to_string()));

        assert_eq!(fanout.deliver(&notification("users-1", 1)), 0);
        assert_eq!(fanout.deliver(&notification("orders-1", 1)), 1);

        let Some(Frame::Change(n)) = sub.next().await else {
            panic!("expected change");
        };
        assert_eq!(&*n.key, "orders-1");
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_and_emits_gap() {
        let fanout = Fanout::new(2, 100, Metrics::new());
        let sub = fanout.subscribe(KeyFilter::All);

        fanout.deliver(&notification("A", 1));
        fanout.deliver(&notification("A", 2));
        // Queue full: sequence 1 is dropped for a gap.
        fanout.deliver(&notification("A", 3));

        let frames = [
            sub.next().await.unwrap(),
            sub.next().await.unwrap(),
            sub.next().await.unwrap(),
        ];
        assert_eq!(frames[0], Frame::Gap { key: "A".into() });
        let Frame::Change(ref n) = frames[1] else {
            panic!("expected change");
        };
        assert_eq!(n.sequence, 2);
        let Frame::Change(ref n) = frames[2] else {
            panic!("expected change");
        };
        assert_eq!(n.sequence, 3);
        assert_eq!(sub.stats().overflows, 1);
    }

    #[tokio::test]
    async fn test_gaps_coalesce_per_key() {
        let fanout = Fanout::new(1, 100, Metrics::new());
        let sub = fanout.subscribe(KeyFilter::All);

        for seq in 1..=4 {
            fanout.deliver(&notification("A", seq));
        }

        // Three drops coalesce into one gap; only the newest change remains.
        assert_eq!(sub.next().await, Some(Frame::Gap { key: "A".into() }));
        let Some(Frame::Change(n)) = sub.next().await else {
            panic!("expected change");
        };
        assert_eq!(n.sequence, 4);
        assert_eq!(sub.stats().overflows, 3);
    }

    #[tokio::test]
    async fn test_overflow_counted_in_metrics() {
        let metrics = Metrics::new();
        let fanout = Fanout::new(1, 100, metrics.clone());
        let _sub = fanout.subscribe(KeyFilter::All);

        for seq in 1..=4 {
            fanout.deliver(&notification("A", seq));
        }

        // Every drop counts as an overflow error; the coalesced pending gap
        // counts once.
        assert_eq!(
            metrics
                .errors_total
                .with_label_values(&["subscriber_overflow"])
                .get(),
            3.0
        );
        assert_eq!(metrics.gap_frames_total.get(), 1.0);
    }

    #[tokio::test]
    async fn test_repeated_overflow_terminates_subscription() {
        let fanout = Fanout::new(1, 2, Metrics::new());
        let sub = fanout.subscribe(KeyFilter::All);

        for seq in 1..=4 {
            fanout.deliver(&notification("A", seq));
        }

        assert_eq!(fanout.subscriber_count(), 0);
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream() {
        let fanout = Fanout::new(8, 4, Metrics::new());
        let sub = fanout.subscribe(KeyFilter::All);

        fanout.unsubscribe(sub.id());
        assert_eq!(fanout.subscriber_count(), 0);
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_publisher() {
        let fanout = Fanout::new(1, 1000, Metrics::new());
        let _sub = fanout.subscribe(KeyFilter::All);

        // Never consumed; deliver must keep returning without blocking.
        for seq in 1..=100 {
            fanout.deliver(&notification("A", seq));
        }
    }
}
