#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use furly::conf::{MqttOptions, RetryConfig};
use furly::{ClientEvent, EventConsumerRef, Message, MqttError};

pub fn options(client_id: &str, partitions: usize) -> MqttOptions {
    MqttOptions {
        client_id: client_id.into(),
        number_of_client_partitions: partitions,
        connection_retry: RetryConfig::Fixed { interval: Duration::from_millis(20), max_attempts: 0 },
        connection_attempt_timeout: Duration::from_millis(500),
        startup_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// A consumer forwarding every message to the returned receiver.
pub fn collector() -> (EventConsumerRef, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let consumer = move |msg: Message| {
        let tx = tx.clone();
        async move {
            tx.send(msg).map_err(|e| MqttError::from(e.to_string()))?;
            Ok::<(), MqttError>(())
        }
    };
    (Arc::new(consumer), rx)
}

pub async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(msg)) => msg,
        other => panic!("no message received, {:?}", other),
    }
}

/// True when no message arrives within 100ms, a closed and drained channel counts as empty.
pub async fn nothing(rx: &mut mpsc::UnboundedReceiver<Message>) -> bool {
    matches!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await, Err(_) | Ok(None))
}

/// Polls `f` until it holds, up to two seconds.
pub async fn eventually<F: FnMut() -> bool>(mut f: F) -> bool {
    for _ in 0..200 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}

pub async fn next_event<F>(rx: &mut broadcast::Receiver<ClientEvent>, mut f: F) -> Option<ClientEvent>
where
    F: FnMut(&ClientEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(ev) if f(&ev) => return Some(ev),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait).await.ok().flatten()
}
