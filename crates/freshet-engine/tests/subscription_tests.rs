//! Push subscription tests: per-key ordering, gap markers, termination.

use chrono::{Duration, TimeZone, Utc};
use freshet_engine::{
    Engine, EngineConfig, Event, Frame, KeyFilter, MemoryAdapter,
};
use std::sync::Arc;

fn at(secs: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn event(offset: u64, key: &str, secs: i64, value: f64) -> Event {
    Event::new(0, offset)
        .with_key(key)
        .with_value(value)
        .with_event_time(at(secs))
}

fn config(queue_depth: usize, overflow_threshold: u32) -> EngineConfig {
    EngineConfig {
        out_of_orderness: Duration::zero(),
        subscriber_queue_depth: queue_depth,
        overflow_disconnect_threshold: overflow_threshold,
        ..EngineConfig::default()
    }
}

/// Events that close three consecutive windows for key "A".
fn three_window_log() -> Vec<Event> {
    vec![
        event(0, "A", 10, 1.0),
        event(1, "A", 70, 2.0),
        event(2, "A", 130, 3.0),
        event(3, "A", 600, 0.0),
    ]
}

#[tokio::test]
async fn test_sequences_strictly_increase_per_key() {
    let adapter = Arc::new(MemoryAdapter::from_events(three_window_log()));
    let engine = Engine::new(config(64, 16), adapter);
    let sub = engine.subscribe(KeyFilter::All);

    engine.start();
    engine.wait().await.unwrap();

    let mut last_sequence = 0;
    let mut changes = 0;
    while changes < 3 {
        match sub.next().await.expect("stream ended early") {
            Frame::Change(n) => {
                assert_eq!(&*n.key, "A");
                assert!(n.sequence > last_sequence, "sequence went backwards");
                last_sequence = n.sequence;
                changes += 1;
            }
            Frame::Gap { .. } => panic!("no gap expected at this depth"),
        }
    }
}

#[tokio::test]
async fn test_revision_carries_old_value() {
    let cfg = EngineConfig {
        grace: Duration::seconds(30),
        ..config(64, 16)
    };
    let adapter = Arc::new(MemoryAdapter::from_events(vec![
        event(0, "A", 10, 1.0),
        // Closes [0,60); grace runs to 90.
        event(1, "B", 70, 0.0),
        // Late revision within grace.
        event(2, "A", 50, 2.0),
    ]));
    let engine = Engine::new(cfg, adapter);
    let sub = engine.subscribe(KeyFilter::Keys(
        [freshet_engine::Key::from("A")].into_iter().collect(),
    ));

    engine.start();
    engine.wait().await.unwrap();

    let Some(Frame::Change(first)) = sub.next().await else {
        panic!("expected initial close");
    };
    let Some(Frame::Change(revision)) = sub.next().await else {
        panic!("expected revision");
    };
    assert_eq!(revision.old_value, first.new_value);
    assert!(revision.sequence > first.sequence);
}

#[tokio::test]
async fn test_overflow_emits_gap_then_newer_changes() {
    let adapter = Arc::new(MemoryAdapter::from_events(three_window_log()));
    // Queue depth 1: the first two closes overflow into a coalesced gap.
    let engine = Engine::new(config(1, 100), adapter);
    let sub = engine.subscribe(KeyFilter::All);

    engine.start();
    engine.wait().await.unwrap();

    let Some(Frame::Gap { key }) = sub.next().await else {
        panic!("expected gap first");
    };
    assert_eq!(&*key, "A");

    // After a gap, only newer sequences follow.
    let Some(Frame::Change(n)) = sub.next().await else {
        panic!("expected change after gap");
    };
    assert_eq!(n.sequence, 3);
    assert_eq!(sub.stats().overflows, 2);
}

#[tokio::test]
async fn test_repeated_overflow_terminates_subscriber() {
    let adapter = Arc::new(MemoryAdapter::from_events(three_window_log()));
    let engine = Engine::new(config(1, 2), adapter);
    let sub = engine.subscribe(KeyFilter::All);

    engine.start();
    engine.wait().await.unwrap();

    assert_eq!(sub.next().await, None);
    assert_eq!(engine.stats().subscribers, 0);
}

#[tokio::test]
async fn test_key_filter_limits_frames() {
    let adapter = Arc::new(MemoryAdapter::from_events(vec![
        event(0, "A", 10, 1.0),
        event(1, "B", 20, 5.0),
        event(2, "A", 600, 0.0),
    ]));
    let engine = Engine::new(config(64, 16), adapter);
    let sub = engine.subscribe(KeyFilter::Prefix("B".to_string()));

    engine.start();
    engine.wait().await.unwrap();

    let Some(Frame::Change(n)) = sub.next().await else {
        panic!("expected change for B");
    };
    assert_eq!(&*n.key, "B");
}
