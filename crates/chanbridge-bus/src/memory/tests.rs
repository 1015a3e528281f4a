use super::*;
use futures::StreamExt;
use std::time::Duration;

const SUBJECT: &str = "channels.default.orders";

async fn next(sub: &mut Subscription) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), sub.messages.next())
        .await
        .expect("timed out waiting for delivery")
        .expect("stream ended")
}

#[tokio::test]
async fn test_publish_fans_out_to_every_durable() {
    let bus = InMemoryBus::new();
    let mut a = bus.subscribe(SUBJECT, "a").await.unwrap();
    let mut b = bus.subscribe(SUBJECT, "b").await.unwrap();

    bus.publish(SUBJECT, Bytes::from_static(b"hello"), HashMap::new())
        .await
        .unwrap();

    let da = next(&mut a).await;
    let db = next(&mut b).await;
    assert_eq!(da.message.payload, Bytes::from_static(b"hello"));
    assert_eq!(db.message.sequence, da.message.sequence);
    assert!(!da.message.redelivered);
}

#[tokio::test]
async fn test_other_subjects_are_not_routed() {
    let bus = InMemoryBus::new();
    let mut a = bus.subscribe(SUBJECT, "a").await.unwrap();

    bus.publish("channels.default.other", Bytes::from_static(b"x"), HashMap::new())
        .await
        .unwrap();
    bus.publish(SUBJECT, Bytes::from_static(b"y"), HashMap::new())
        .await
        .unwrap();

    let d = next(&mut a).await;
    assert_eq!(d.message.payload, Bytes::from_static(b"y"));
}

#[tokio::test]
async fn test_ack_clears_pending() {
    let bus = InMemoryBus::new();
    let mut a = bus.subscribe(SUBJECT, "a").await.unwrap();

    bus.publish(SUBJECT, Bytes::from_static(b"1"), HashMap::new())
        .await
        .unwrap();
    assert_eq!(bus.pending("a"), 1);

    let d = next(&mut a).await;
    let seq = d.message.sequence;
    d.ack().await.unwrap();

    assert_eq!(bus.pending("a"), 0);
    assert_eq!(bus.acked("a"), vec![seq]);
    assert_eq!(bus.stats().acked, 1);
}

#[tokio::test]
async fn test_disconnect_ends_streams_and_replays_unacked() {
    let bus = InMemoryBus::new();
    let mut state = bus.connection_state();
    let mut a = bus.subscribe(SUBJECT, "a").await.unwrap();

    bus.publish(SUBJECT, Bytes::from_static(b"1"), HashMap::new())
        .await
        .unwrap();
    let _unacked = next(&mut a).await;

    bus.disconnect();
    state.changed().await.unwrap();
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    assert!(a.messages.next().await.is_none());
    assert!(bus.subscribe(SUBJECT, "a").await.is_err());

    bus.reconnect();
    let mut resumed = bus.subscribe(SUBJECT, "a").await.unwrap();
    let replayed = next(&mut resumed).await;
    assert!(replayed.message.redelivered);
    assert_eq!(replayed.message.payload, Bytes::from_static(b"1"));
    assert_eq!(bus.stats().reconnects, 1);
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let bus = InMemoryBus::new();
    let sub = bus.subscribe(SUBJECT, "a").await.unwrap();

    bus.unsubscribe(&sub.handle).await.unwrap();
    bus.unsubscribe(&sub.handle).await.unwrap();

    let stats = bus.stats();
    assert_eq!(stats.unsubscribe_calls, 2);
    assert_eq!(stats.active_subscriptions, 0);
    assert!(bus.durable_names().is_empty());
}

#[tokio::test]
async fn test_second_consumer_on_active_durable_is_rejected() {
    let bus = InMemoryBus::new();
    let _first = bus.subscribe(SUBJECT, "a").await.unwrap();
    let second = bus.subscribe(SUBJECT, "a").await;
    assert!(matches!(second, Err(Error::Subscribe { .. })));
}

#[tokio::test]
async fn test_fail_subscriptions() {
    let bus = InMemoryBus::new();
    bus.fail_subscriptions(SUBJECT, true);
    assert!(bus.subscribe(SUBJECT, "a").await.is_err());

    bus.fail_subscriptions(SUBJECT, false);
    assert!(bus.subscribe(SUBJECT, "a").await.is_ok());
    assert_eq!(bus.stats().subscribe_calls, 2);
}

#[tokio::test]
async fn test_closed_bus_rejects_operations() {
    let bus = InMemoryBus::new();
    bus.close().await;

    assert!(matches!(
        bus.publish(SUBJECT, Bytes::new(), HashMap::new()).await,
        Err(Error::Closed)
    ));
    assert_eq!(bus.stats().state, ConnectionState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconnect_counter_is_visible_to_woken_watchers() {
    let bus = InMemoryBus::new();
    for round in 1..=200u64 {
        bus.disconnect();
        let mut state = bus.connection_state();

        let watcher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                state.changed().await.unwrap();
                let seen = *state.borrow_and_update();
                (seen, bus.stats().reconnects)
            })
        };
        let reconnect = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.reconnect() })
        };

        reconnect.await.unwrap();
        let (seen, reconnects) = watcher.await.unwrap();
        assert_eq!(seen, ConnectionState::Connected);
        assert_eq!(reconnects, round);
    }
}

#[tokio::test]
async fn test_reconnect_while_connected_is_not_counted() {
    let bus = InMemoryBus::new();
    bus.reconnect();
    assert_eq!(bus.stats().reconnects, 0);

    bus.disconnect();
    bus.reconnect();
    bus.reconnect();
    assert_eq!(bus.stats().reconnects, 1);
}

#[tokio::test]
async fn test_ack_log_keeps_only_recent_acks() {
    let bus = InMemoryBus::new();
    let mut a = bus.subscribe(SUBJECT, "a").await.unwrap();
    let total = ACK_LOG_CAPACITY + 10;

    for _ in 0..total {
        bus.publish(SUBJECT, Bytes::from_static(b"m"), HashMap::new())
            .await
            .unwrap();
        next(&mut a).await.ack().await.unwrap();
    }

    let acked = bus.acked("a");
    assert_eq!(acked.len(), ACK_LOG_CAPACITY);
    assert_eq!(acked.first(), Some(&11));
    assert_eq!(acked.last(), Some(&(total as u64)));
    assert_eq!(bus.stats().acked, total as u64);
    assert_eq!(bus.pending("a"), 0);
}

#[tokio::test]
async fn test_resubscribe_after_dropped_stream_releases_old_handle() {
    let bus = InMemoryBus::new();
    let first = bus.subscribe(SUBJECT, "a").await.unwrap();
    drop(first);

    let mut second = bus.subscribe(SUBJECT, "a").await.unwrap();
    assert_eq!(bus.stats().active_subscriptions, 1);

    bus.publish(
        SUBJECT,
        Bytes::from_static(b"h"),
        HashMap::from([("ce-id".to_string(), "7".to_string())]),
    )
    .await
    .unwrap();
    let d = next(&mut second).await;
    assert_eq!(d.message.headers["ce-id"], "7");
    assert_eq!(d.message.subject, SUBJECT);
}
