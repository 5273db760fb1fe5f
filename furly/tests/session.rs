mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use furly::conf::RetryConfig;
use furly::{
    ClientEvent, ConnectionState, EventClient, MemoryBroker, Message, MqttClient, MqttError, OverflowStrategy, QoS,
};

use common::{collector, eventually, next_event, nothing, options, recv};

#[tokio::test]
async fn end_to_end_delivery() {
    let (client, _broker) = MqttClient::in_memory(options("e2e", 1));
    client.ready().await.unwrap();

    let (consumer, mut rx) = collector();
    let _subscription = client.subscribe_with("test/+", QoS::AtLeastOnce, consumer, true, None).await.unwrap();

    client
        .event()
        .topic("test/alpha")
        .content_type("application/octet-stream")
        .buffer(vec![1u8, 2, 3])
        .send()
        .await
        .unwrap();

    let msg = recv(&mut rx).await;
    assert_eq!(msg.topic, "test/alpha");
    assert_eq!(msg.payload.as_ref(), [1, 2, 3]);
    assert_eq!(msg.properties.content_type.as_deref(), Some("application/octet-stream"));
    assert!(nothing(&mut rx).await);

    client.close().await.unwrap();
}

#[tokio::test]
async fn subscriptions_replayed_after_reconnect() {
    let (client, broker) = MqttClient::in_memory(options("resub", 1));
    client.ready().await.unwrap();

    let (consumer, mut rx) = collector();
    let _subscription = client.subscribe_with("sensors/#", QoS::AtLeastOnce, consumer, true, None).await.unwrap();
    assert_eq!(broker.subscriptions("resub"), vec!["sensors/#"]);

    assert!(broker.kick("resub"));
    assert!(broker.subscriptions("resub").is_empty());
    assert!(eventually(|| broker.connects() == 2 && !broker.subscriptions("resub").is_empty()).await);
    assert!(eventually(|| client.state(0) == Some(ConnectionState::Connected)).await);

    client.publish(Message::new("sensors/1/temp", vec![21u8])).await.unwrap();
    let msg = recv(&mut rx).await;
    assert_eq!(msg.topic, "sensors/1/temp");
    assert!(nothing(&mut rx).await);

    client.close().await.unwrap();
}

#[tokio::test]
async fn queued_while_disconnected_then_replayed() {
    let broker = MemoryBroker::new();
    broker.set_refuse_connections(true);
    let client = MqttClient::new(options("offline", 1), Arc::new(broker.clone()));

    for n in 0..5u8 {
        client.publish(Message::new("offline/data", vec![n])).await.unwrap();
    }
    assert_eq!(broker.published("offline/data"), 0);
    assert!(eventually(|| client.state(0) == Some(ConnectionState::Reconnecting)).await);

    broker.set_refuse_connections(false);
    client.ready().await.unwrap();
    assert!(eventually(|| broker.published("offline/data") == 5).await);

    client.close().await.unwrap();
}

#[tokio::test]
async fn drop_new_overflow_while_disconnected() {
    let broker = MemoryBroker::new();
    broker.set_refuse_connections(true);
    let mut opts = options("drop-new", 1);
    opts.max_pending_messages = 3;
    opts.overflow_strategy = OverflowStrategy::DropNewMessage;
    let client = MqttClient::new(opts, Arc::new(broker.clone()));
    let mut events = client.events();

    for n in 1..=3u8 {
        client.publish(Message::new(format!("q/{}", n), vec![n])).await.unwrap();
    }
    let res = client.publish(Message::new("q/4", vec![4u8])).await;
    assert!(matches!(res, Err(MqttError::QueueOverflow { strategy: OverflowStrategy::DropNewMessage, .. })));

    let ev = next_event(&mut events, |ev| matches!(ev, ClientEvent::QueueOverflow { .. })).await;
    match ev {
        Some(ClientEvent::QueueOverflow { partition, state, .. }) => {
            assert_eq!(partition, 0);
            assert!(!state.is_connected());
        }
        other => panic!("{:?}", other),
    }

    broker.set_refuse_connections(false);
    client.ready().await.unwrap();
    assert!(eventually(|| (1..=3).all(|n| broker.published(&format!("q/{}", n)) == 1)).await);
    assert_eq!(broker.published("q/4"), 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn drop_oldest_overflow_fails_evicted_waiter() {
    let broker = MemoryBroker::new();
    broker.set_refuse_connections(true);
    let mut opts = options("drop-oldest", 1);
    opts.max_pending_messages = 3;
    opts.overflow_strategy = OverflowStrategy::DropOldestQueuedMessage;
    let client = MqttClient::new(opts, Arc::new(broker.clone()));

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.publish_confirmed(Message::new("q/1", vec![1u8])).await })
    };
    assert!(eventually(|| client.stats()["partitions"][0]["queues"]["publish"]["count"] == 1).await);
    for n in 2..=4u8 {
        client.publish(Message::new(format!("q/{}", n), vec![n])).await.unwrap();
    }
    let res = first.await.unwrap();
    assert!(matches!(
        res,
        Err(MqttError::QueueOverflow { strategy: OverflowStrategy::DropOldestQueuedMessage, .. })
    ));

    broker.set_refuse_connections(false);
    client.ready().await.unwrap();
    assert!(eventually(|| (2..=4).all(|n| broker.published(&format!("q/{}", n)) == 1)).await);
    assert_eq!(broker.published("q/1"), 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn session_expired_is_reported() {
    let mut opts = options("persistent", 1);
    opts.clean_start = false;
    opts.session_expiry = Duration::from_secs(300);
    let (client, broker) = MqttClient::in_memory(opts);
    let mut events = client.events();
    client.ready().await.unwrap();

    let (consumer, mut rx) = collector();
    let _subscription = client.subscribe_with("s/#", QoS::AtLeastOnce, consumer, true, None).await.unwrap();

    //a resumed session keeps its subscriptions and is not reported
    assert!(broker.kick("persistent"));
    assert!(eventually(|| broker.connects() == 2 && client.state(0) == Some(ConnectionState::Connected)).await);
    assert_eq!(broker.subscriptions("persistent"), vec!["s/#"]);

    assert!(broker.expire_session("persistent"));
    let ev = next_event(&mut events, |ev| matches!(ev, ClientEvent::SessionExpired { .. })).await;
    assert_eq!(ev, Some(ClientEvent::SessionExpired { partition: 0 }));
    assert!(eventually(|| broker.subscriptions("persistent") == vec!["s/#"]).await);

    client.publish(Message::new("s/after", vec![9u8])).await.unwrap();
    assert_eq!(recv(&mut rx).await.topic, "s/after");

    client.close().await.unwrap();
}

#[tokio::test]
async fn overlapping_filters_on_different_partitions_deliver_once() {
    let (client, _broker) = MqttClient::in_memory(options("overlap", 2));
    client.ready().await.unwrap();
    assert_ne!(client.partition_for("+/+"), client.partition_for("a/b"));

    let (wide, mut wide_rx) = collector();
    let (exact, mut exact_rx) = collector();
    let _wide = client.subscribe_with("+/+", QoS::AtLeastOnce, wide, true, None).await.unwrap();
    let _exact = client.subscribe_with("a/b", QoS::AtLeastOnce, exact, true, None).await.unwrap();

    client.publish(Message::new("a/b", vec![1u8])).await.unwrap();
    assert_eq!(recv(&mut wide_rx).await.topic, "a/b");
    assert_eq!(recv(&mut exact_rx).await.topic, "a/b");
    assert!(nothing(&mut wide_rx).await);
    assert!(nothing(&mut exact_rx).await);

    client.publish(Message::new("c/d", vec![2u8])).await.unwrap();
    assert_eq!(recv(&mut wide_rx).await.topic, "c/d");
    assert!(nothing(&mut wide_rx).await);
    assert!(nothing(&mut exact_rx).await);

    client.close().await.unwrap();
}

#[tokio::test]
async fn partitions_are_deterministic() {
    let (a, broker) = MqttClient::in_memory(options("parts", 4));
    a.ready().await.unwrap();
    for index in 0..4 {
        assert!(broker.is_connected(&format!("parts_{}", index)));
    }

    let b = MqttClient::new(options("parts-b", 4), Arc::new(broker.clone()));
    let topics = (0..32).map(|n| format!("devices/{}/telemetry", n)).collect::<Vec<_>>();
    for topic in topics.iter() {
        let p = a.partition_for(topic);
        assert!(p < 4);
        assert_eq!(p, a.partition_for(topic));
        assert_eq!(p, b.partition_for(topic));
        assert_eq!(p, furly::partition_for(topic, 4));
    }
    assert!(topics.iter().map(|t| a.partition_for(t)).collect::<std::collections::HashSet<_>>().len() > 1);

    let (consumer, mut rx) = collector();
    let _subscription = a.subscribe_with("devices/#", QoS::AtLeastOnce, consumer, true, None).await.unwrap();
    for topic in topics.iter() {
        a.publish(Message::new(topic.as_str(), Vec::<u8>::new())).await.unwrap();
    }
    let mut received = Vec::new();
    for _ in 0..topics.len() {
        received.push(recv(&mut rx).await.topic.to_string());
    }
    received.sort();
    let mut expected = topics.clone();
    expected.sort();
    assert_eq!(received, expected);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn handle_drop_removes_only_its_registration() {
    let (client, broker) = MqttClient::in_memory(options("handles", 1));
    client.ready().await.unwrap();

    let (first, mut first_rx) = collector();
    let (second, mut second_rx) = collector();
    let first = client.subscribe_with("h/+", QoS::AtLeastOnce, first, true, None).await.unwrap();
    let second = client.subscribe_with("h/+", QoS::AtLeastOnce, second, true, None).await.unwrap();
    assert_ne!(first.id(), second.id());

    drop(first);
    client.publish(Message::new("h/1", vec![1u8])).await.unwrap();
    assert_eq!(recv(&mut second_rx).await.topic, "h/1");
    assert!(nothing(&mut first_rx).await);
    assert_eq!(broker.subscriptions("handles"), vec!["h/+"]);

    second.unsubscribe().unwrap();
    assert!(eventually(|| broker.subscriptions("handles").is_empty()).await);

    client.close().await.unwrap();
}

#[tokio::test]
async fn invalid_filter_rejected() {
    let (client, broker) = MqttClient::in_memory(options("invalid", 1));
    let (consumer, _rx) = collector();
    let res = client.subscribe_with("a+/b", QoS::AtLeastOnce, consumer.clone(), false, None).await;
    assert!(matches!(res, Err(MqttError::InvalidFilter(_))));
    let res = client.subscribe_with("a/#/b", QoS::AtLeastOnce, consumer, false, None).await;
    assert!(matches!(res, Err(MqttError::InvalidFilter(_))));
    assert!(matches!(client.publish(Message::new("a/+", Vec::<u8>::new())).await, Err(MqttError::InvalidFilter(_))));

    client.ready().await.unwrap();
    assert!(broker.subscriptions("invalid").is_empty());
    client.close().await.unwrap();
}

#[tokio::test]
async fn strict_routing_reports_unroutable() {
    let mut opts = options("strict", 1);
    opts.strict_routing = true;
    let (client, _broker) = MqttClient::in_memory(opts);
    client.ready().await.unwrap();

    let res = client.publish_confirmed(Message::new("nobody/listens", vec![1u8])).await;
    assert!(matches!(res, Err(MqttError::Unroutable(topic)) if topic == "nobody/listens"));
    //a rejected message does not break the connection
    assert_eq!(client.state(0), Some(ConnectionState::Connected));

    let (consumer, _rx) = collector();
    let _subscription = client.subscribe_with("somebody/+", QoS::AtLeastOnce, consumer, true, None).await.unwrap();
    client.publish_confirmed(Message::new("somebody/listens", vec![1u8])).await.unwrap();

    client.close().await.unwrap();
}

#[tokio::test]
async fn canceled_publish_leaves_queue() {
    let broker = MemoryBroker::new();
    broker.set_refuse_connections(true);
    let client = MqttClient::new(options("cancel", 1), Arc::new(broker.clone()));

    let token = CancellationToken::new();
    let publish = {
        let client = client.clone();
        let token = token.clone();
        tokio::spawn(async move {
            client.publish_confirmed_with(Message::new("c/1", vec![1u8]), Some(&token)).await
        })
    };
    assert!(eventually(|| client.stats()["partitions"][0]["queues"]["publish"]["count"] == 1).await);
    token.cancel();
    assert!(matches!(publish.await.unwrap(), Err(MqttError::Canceled)));
    assert_eq!(client.stats()["partitions"][0]["queues"]["publish"]["count"], 0);

    broker.set_refuse_connections(false);
    client.ready().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.published("c/1"), 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn first_connect_failure_faults_without_retry() {
    let broker = MemoryBroker::new();
    broker.set_refuse_connections(true);
    let mut opts = options("no-retry", 1);
    opts.retry_on_first_connect = false;
    let client = MqttClient::new(opts, Arc::new(broker.clone()));

    assert!(matches!(client.ready().await, Err(MqttError::ConnectingFailed(_))));
    assert_eq!(client.state(0), Some(ConnectionState::Faulted));
    assert!(matches!(client.publish(Message::new("x", Vec::<u8>::new())).await, Err(MqttError::ConnectingFailed(_))));

    broker.set_refuse_connections(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.connects(), 0);
    client.close().await.unwrap();
    assert_eq!(client.state(0), Some(ConnectionState::Faulted));
}

#[tokio::test]
async fn bounded_retry_exhausted_faults() {
    let broker = MemoryBroker::new();
    broker.set_connect_delay(Some(Duration::from_millis(200)));
    let mut opts = options("bounded", 1);
    opts.connection_attempt_timeout = Duration::from_millis(30);
    opts.connection_retry = RetryConfig::Fixed { interval: Duration::from_millis(10), max_attempts: 2 };
    let client = MqttClient::new(opts, Arc::new(broker.clone()));
    let mut events = client.events();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let confirmed = {
        let client = client.clone();
        tokio::spawn(async move {
            let _ = tx.send(());
            client.publish_confirmed(Message::new("b/1", Vec::<u8>::new())).await
        })
    };
    rx.await.unwrap();

    match client.ready().await {
        Err(MqttError::ConnectingFailed(reason)) => assert!(reason.contains("timed out"), "{}", reason),
        other => panic!("{:?}", other),
    }
    let ev = next_event(&mut events, |ev| {
        matches!(ev, ClientEvent::StateChanged { state: ConnectionState::Faulted, .. })
    })
    .await;
    assert!(ev.is_some() || client.state(0) == Some(ConnectionState::Faulted));
    assert!(matches!(confirmed.await.unwrap(), Err(MqttError::ConnectingFailed(_))));
    client.close().await.unwrap();
}

#[tokio::test]
async fn close_is_final() {
    let (client, broker) = MqttClient::in_memory(options("closing", 2));
    client.ready().await.unwrap();
    assert!(broker.is_connected("closing_0") && broker.is_connected("closing_1"));

    client.close().await.unwrap();
    assert!(client.is_closed());
    assert_eq!(client.states(), vec![ConnectionState::Disconnected; 2]);
    assert!(!broker.is_connected("closing_0") && !broker.is_connected("closing_1"));
    assert!(matches!(client.publish(Message::new("x", Vec::<u8>::new())).await, Err(MqttError::Closed)));
    client.close().await.unwrap();
}
