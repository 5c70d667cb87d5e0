//! Bounded-log rotation: what a follower sees when the log outruns it.
//!
//! These run on the current-thread runtime so the follower task only gets
//! polled when a test yields, which makes "publish faster than the follower
//! reads" deterministic.

use herald::{
    Channel, ChannelConfig, ChannelError, ChannelEvent, ChannelState, EntryId, LifecycleFilter,
    LifecycleHandle, MemoryStore,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

type Seen = Arc<Mutex<Vec<Value>>>;

fn recorder() -> (Seen, impl Fn(&Value) + Send + Sync + 'static) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |v: &Value| sink.lock().push(v.clone()))
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

async fn next_event(events: &LifecycleHandle) -> ChannelEvent {
    for _ in 0..400 {
        if let Ok(event) = events.try_recv() {
            return event;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no lifecycle event in time");
}

fn capped(max: u64) -> ChannelConfig {
    ChannelConfig::new("capped").bounded(1_000_000, Some(max))
}

#[tokio::test(flavor = "current_thread")]
async fn test_burst_before_first_read_loses_oldest() {
    let store = Arc::new(MemoryStore::new());
    let channel = Channel::open(capped(10), store.clone()).await.unwrap();
    let (seen, listener) = recorder();
    channel.subscribe("a", listener).unwrap();

    // Marker plus eleven messages into a ten-entry log: the marker and the
    // first message rotate out before the follower reads anything.
    for i in 0..11 {
        channel.publish("a", &json!(i)).await.unwrap();
    }
    let retained = store.entries("capped").unwrap();
    assert_eq!(retained.len(), 10);
    assert_eq!(retained[0].message, Some(json!(1)));

    wait_until(|| seen.lock().len() == 10).await;
    let expected: Vec<Value> = (1..11).map(|i| json!(i)).collect();
    assert_eq!(*seen.lock(), expected);
    assert_eq!(channel.state(), ChannelState::Listening);
}

#[tokio::test(flavor = "current_thread")]
async fn test_follower_keeping_up_sees_everything() {
    let store = Arc::new(MemoryStore::new());
    let channel = Channel::open(capped(3), store.clone()).await.unwrap();
    let (seen, listener) = recorder();
    channel.subscribe_all(listener).unwrap();

    for i in 0..20 {
        channel.publish("a", &json!(i)).await.unwrap();
        let want = i as usize + 1;
        wait_until(|| seen.lock().len() == want).await;
    }

    assert_eq!(store.len("capped").unwrap(), 3);
    let expected: Vec<Value> = (0..20).map(|i| json!(i)).collect();
    assert_eq!(*seen.lock(), expected);
}

#[tokio::test(flavor = "current_thread")]
async fn test_overtaken_cursor_reports_lost_position() {
    let store = Arc::new(MemoryStore::new());
    let channel = Channel::open(capped(5), store.clone()).await.unwrap();
    let events = channel.events_filtered(LifecycleFilter::cursor());
    let (seen, listener) = recorder();
    channel.subscribe_all(listener).unwrap();

    let mut ids = Vec::new();
    for i in 0..2 {
        ids.push(channel.publish("a", &json!(i)).await.unwrap());
    }
    wait_until(|| seen.lock().len() == 2).await;

    // Rotate well past the cursor's position without letting it read.
    for i in 2..17 {
        channel.publish("a", &json!(i)).await.unwrap();
    }

    match next_event(&events).await {
        ChannelEvent::CursorError { error } => match *error {
            ChannelError::CursorLost { last_seen, oldest } => {
                assert_eq!(last_seen, ids[1]);
                assert!(oldest > EntryId(ids[1].0 + 1));
            }
            ref other => panic!("expected lost cursor, got {other:?}"),
        },
        other => panic!("expected cursor-error, got {other:?}"),
    }
    assert!(matches!(next_event(&events).await, ChannelEvent::CursorClose));
    assert_eq!(*seen.lock(), vec![json!(0), json!(1)]);

    // Reconnecting resumes after the oldest retained entry.
    channel.listen(None).await.unwrap();
    wait_until(|| seen.lock().len() == 6).await;
    let tail: Vec<Value> = seen.lock()[2..].to_vec();
    assert_eq!(tail, vec![json!(13), json!(14), json!(15), json!(16)]);
}

#[tokio::test(flavor = "current_thread")]
async fn test_size_limit_rotates() {
    let store = Arc::new(MemoryStore::new());
    let config = ChannelConfig::new("small").bounded(512, None);
    let channel = Channel::open(config, store.clone()).await.unwrap();

    let payload = "x".repeat(100);
    for i in 0..20 {
        channel
            .publish("a", &json!({ "i": i, "payload": payload }))
            .await
            .unwrap();
    }

    let retained = store.entries("small").unwrap();
    assert!(retained.len() < 20);
    assert_eq!(retained.last().unwrap().message.as_ref().unwrap()["i"], json!(19));
}
