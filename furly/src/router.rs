//! Event dispatch.
//!
//! Holds every registration made through the client, keyed by subscription id,
//! together with a per filter reference count that decides when the broker
//! side subscription must be created or removed. Inbound messages are handed
//! to every registration whose filter matches the topic and which belongs to
//! the partition the message arrived on.
//!
//! Consumers run one after another on the dispatching partition's task, so
//! messages reach a consumer in arrival order. A consumer that blocks delays
//! every later message of that partition, long running work belongs in a
//! spawned task.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use serde_json::json;

use crate::topic::Topic;
use crate::types::{DashMap, Message, PartitionIndex, QoS, SubscriptionId, TopicFilter};
use crate::Result;

/// Receives the messages matching a subscription.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    async fn consume(&self, msg: Message) -> Result<()>;
}

#[async_trait]
impl<F, Fut> EventConsumer for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    #[inline]
    async fn consume(&self, msg: Message) -> Result<()> {
        self(msg).await
    }
}

pub type EventConsumerRef = Arc<dyn EventConsumer>;

pub struct Registration {
    pub id: SubscriptionId,
    pub filter: TopicFilter,
    pub qos: QoS,
    pub partition: PartitionIndex,
    topic: Topic,
    consumer: EventConsumerRef,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("partition", &self.partition)
            .finish()
    }
}

pub struct Router {
    registrations: DashMap<SubscriptionId, Arc<Registration>>,
    filters: DashMap<TopicFilter, usize>,
    next_id: AtomicU64,
    dispatched: AtomicUsize,
    unmatched: AtomicUsize,
    failed: AtomicUsize,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            registrations: DashMap::default(),
            filters: DashMap::default(),
            next_id: AtomicU64::new(1),
            dispatched: AtomicUsize::new(0),
            unmatched: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    /// Adds a registration owned by `partition`, the flag is true for the first
    /// registration of `filter`.
    pub fn add(
        &self,
        filter: &str,
        qos: QoS,
        partition: PartitionIndex,
        consumer: EventConsumerRef,
    ) -> Result<(SubscriptionId, bool)> {
        let topic = filter.parse::<Topic>()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let filter = TopicFilter::from(filter);
        let first = match self.filters.entry(filter.clone()) {
            Entry::Occupied(mut o) => {
                *o.get_mut() += 1;
                false
            }
            Entry::Vacant(v) => {
                v.insert(1);
                true
            }
        };
        self.registrations.insert(id, Arc::new(Registration { id, filter, qos, partition, topic, consumer }));
        Ok((id, first))
    }

    /// Removes exactly the registration `id`.
    ///
    /// Returns its filter and whether it was the last registration of it.
    pub fn remove(&self, id: SubscriptionId) -> Option<(TopicFilter, bool)> {
        let (_, reg) = self.registrations.remove(&id)?;
        let last = match self.filters.entry(reg.filter.clone()) {
            Entry::Occupied(mut o) => {
                *o.get_mut() -= 1;
                if *o.get() == 0 {
                    o.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => true,
        };
        Some((reg.filter.clone(), last))
    }

    #[inline]
    pub fn is_active(&self, filter: &str) -> bool {
        self.filters.contains_key(filter)
    }

    /// Every active filter with the highest QoS requested for it.
    pub fn filters(&self) -> Vec<(TopicFilter, QoS)> {
        let mut filters: Vec<(TopicFilter, QoS)> = Vec::new();
        for reg in self.registrations.iter() {
            match filters.iter_mut().find(|(f, _)| f == &reg.filter) {
                Some((_, qos)) => *qos = (*qos).max(reg.qos),
                None => filters.push((reg.filter.clone(), reg.qos)),
            }
        }
        filters
    }

    #[inline]
    pub fn qos(&self, filter: &str) -> Option<QoS> {
        self.registrations.iter().filter(|reg| reg.filter == filter).map(|reg| reg.qos).max()
    }

    /// Invokes every consumer of `partition` matching the topic, returns the number of matches.
    ///
    /// The broker delivers a message once per connection whose subscriptions match it,
    /// registrations of other partitions are served by their own copy.
    /// A failing or panicking consumer is logged and does not affect the others.
    pub async fn dispatch(&self, partition: PartitionIndex, msg: Message) -> usize {
        let matched = self
            .registrations
            .iter()
            .filter(|reg| reg.partition == partition && reg.topic.matches_str(&msg.topic))
            .map(|reg| reg.value().clone())
            .collect::<Vec<_>>();

        if matched.is_empty() {
            self.unmatched.fetch_add(1, Ordering::SeqCst);
            log::debug!("no subscription matches topic {}", msg.topic);
            return 0;
        }

        self.dispatched.fetch_add(1, Ordering::SeqCst);
        for reg in matched.iter() {
            match AssertUnwindSafe(reg.consumer.consume(msg.clone())).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.failed.fetch_add(1, Ordering::SeqCst);
                    log::warn!("consumer of {} failed on {}, {}", reg.filter, msg.topic, e);
                }
                Err(_) => {
                    self.failed.fetch_add(1, Ordering::SeqCst);
                    log::error!("consumer of {} panicked on {}", reg.filter, msg.topic);
                }
            }
        }
        matched.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    #[inline]
    pub fn clear(&self) {
        self.registrations.clear();
        self.filters.clear();
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "registrations": self.registrations.len(),
            "filters": self.filters.len(),
            "dispatched": self.dispatched.load(Ordering::SeqCst),
            "unmatched": self.unmatched.load(Ordering::SeqCst),
            "consumer_failures": self.failed.load(Ordering::SeqCst),
        })
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::MqttError;

    fn recorder(name: &'static str, seen: Arc<Mutex<Vec<String>>>) -> EventConsumerRef {
        Arc::new(move |msg: Message| {
            let seen = seen.clone();
            async move {
                seen.lock().push(format!("{}:{}", name, msg.topic));
                Ok::<(), MqttError>(())
            }
        })
    }

    #[tokio::test]
    async fn test_dispatch_all_matches() {
        let router = Router::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        router.add("a/+", QoS::AtMostOnce, 0, recorder("one", seen.clone())).unwrap();
        router.add("a/#", QoS::AtLeastOnce, 0, recorder("two", seen.clone())).unwrap();
        router.add("b", QoS::AtLeastOnce, 0, recorder("three", seen.clone())).unwrap();

        assert_eq!(router.dispatch(0, Message::new("a/x", Vec::<u8>::new())).await, 2);
        assert_eq!(router.dispatch(0, Message::new("c", Vec::<u8>::new())).await, 0);
        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["one:a/x", "two:a/x"]);
    }

    #[tokio::test]
    async fn test_failing_consumers_isolated() {
        let router = Router::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        router
            .add("t", QoS::AtLeastOnce, 0, Arc::new(|_msg: Message| async { Err::<(), _>(MqttError::from("boom")) }))
            .unwrap();
        router
            .add(
                "t",
                QoS::AtLeastOnce,
                0,
                Arc::new(|_msg: Message| async {
                    if true {
                        panic!("consumer panic");
                    }
                    Ok::<(), MqttError>(())
                }),
            )
            .unwrap();
        router.add("t", QoS::AtLeastOnce, 0, recorder("ok", seen.clone())).unwrap();

        assert_eq!(router.dispatch(0, Message::new("t", Vec::<u8>::new())).await, 3);
        assert_eq!(seen.lock().as_slice(), ["ok:t"]);
        assert_eq!(router.to_json()["consumer_failures"], 2);
    }

    #[tokio::test]
    async fn test_dispatch_owned_by_partition() {
        let router = Router::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        router.add("+/+", QoS::AtMostOnce, 0, recorder("wide", seen.clone())).unwrap();
        router.add("a/b", QoS::AtMostOnce, 1, recorder("exact", seen.clone())).unwrap();

        assert_eq!(router.dispatch(0, Message::new("a/b", Vec::<u8>::new())).await, 1);
        assert_eq!(router.dispatch(1, Message::new("a/b", Vec::<u8>::new())).await, 1);
        assert_eq!(router.dispatch(2, Message::new("a/b", Vec::<u8>::new())).await, 0);
        assert_eq!(seen.lock().as_slice(), ["wide:a/b", "exact:a/b"]);
    }

    #[tokio::test]
    async fn test_consumers_see_arrival_order() {
        let router = Router::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let slow = seen.clone();
        router
            .add(
                "o/+",
                QoS::AtMostOnce,
                0,
                Arc::new(move |msg: Message| {
                    let slow = slow.clone();
                    async move {
                        if msg.topic == "o/1" {
                            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                        }
                        slow.lock().push(msg.topic.to_string());
                        Ok::<(), MqttError>(())
                    }
                }),
            )
            .unwrap();
        for topic in ["o/1", "o/2", "o/3"] {
            router.dispatch(0, Message::new(topic, Vec::<u8>::new())).await;
        }
        assert_eq!(seen.lock().as_slice(), ["o/1", "o/2", "o/3"]);
    }

    #[test]
    fn test_refcount() {
        let router = Router::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, first) = router.add("s/#", QoS::AtMostOnce, 0, recorder("a", seen.clone())).unwrap();
        assert!(first);
        let (b, first) = router.add("s/#", QoS::ExactlyOnce, 0, recorder("b", seen.clone())).unwrap();
        assert!(!first);
        assert_eq!(router.filters(), vec![(TopicFilter::from("s/#"), QoS::ExactlyOnce)]);

        assert_eq!(router.remove(b), Some((TopicFilter::from("s/#"), false)));
        assert_eq!(router.remove(b), None);
        assert_eq!(router.qos("s/#"), Some(QoS::AtMostOnce));
        assert!(router.is_active("s/#"));
        assert_eq!(router.remove(a), Some((TopicFilter::from("s/#"), true)));
        assert!(!router.is_active("s/#"));

        assert!(matches!(
            router.add("s/#/x", QoS::AtMostOnce, 0, recorder("c", seen)),
            Err(MqttError::InvalidFilter(_))
        ));
        assert!(router.is_empty());
    }
}
