//! Partitioned session client.
//!
//! Topics are spread over a fixed number of partitions, each one a physical
//! connection with its own outbound queues. A topic always maps to the same
//! partition so operations on it keep their order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{join_all, try_join_all};
use serde_json::json;
use tokio::sync::{broadcast, oneshot, OnceCell};
use tokio_util::sync::CancellationToken;

use furly_conf::MqttOptions;

use crate::connection::Partition;
use crate::memory::MemoryBroker;
use crate::queue::{OpKind, Operation};
use crate::retry::{self, RetryPolicyRef};
use crate::router::{EventConsumer, EventConsumerRef, Router};
use crate::rpc::PendingCalls;
use crate::topic::{self, TopicError};
use crate::types::{ClientEvent, ClientId, ConnectionState, Message, PartitionIndex, QoS, SubscriptionId, TopicFilter};
use crate::wire::WireConnectorRef;
use crate::{MqttError, Result};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;
const EVENTS_CAPACITY: usize = 1024;

#[inline]
fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(FNV_OFFSET_BASIS, |hash, b| (hash ^ b as u64).wrapping_mul(FNV_PRIME))
}

/// The partition owning `topic`, a pure function of the topic and the count.
#[inline]
pub fn partition_for(topic: &str, partitions: usize) -> PartitionIndex {
    if partitions <= 1 {
        return 0;
    }
    (fnv1a(topic) % partitions as u64) as PartitionIndex
}

pub(crate) struct ClientInner {
    pub(crate) opts: Arc<MqttOptions>,
    client_id: ClientId,
    partitions: Vec<Arc<Partition>>,
    router: Arc<Router>,
    pub(crate) calls: PendingCalls,
    pub(crate) reply_subscription: OnceCell<SubscriptionHandle>,
    events: broadcast::Sender<ClientEvent>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        log::debug!("{} client drop", self.client_id);
    }
}

impl ClientInner {
    #[inline]
    fn partition(&self, topic: &str) -> &Arc<Partition> {
        &self.partitions[partition_for(topic, self.partitions.len())]
    }

    #[inline]
    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MqttError::Closed)
        } else {
            Ok(())
        }
    }

    /// Removes one registration, the broker side subscription goes with the last one.
    fn remove_subscription(&self, id: SubscriptionId) -> Result<()> {
        let Some((filter, last)) = self.router.remove(id) else {
            return Ok(());
        };
        log::debug!("{} unsubscribe {}, id: {}, last: {}", self.client_id, filter, id, last);
        if last && !self.closed.load(Ordering::SeqCst) {
            self.partition(&filter).enqueue(Operation::Unsubscribe(filter.clone()), None)?;
        }
        Ok(())
    }

    /// Waits for the outcome of a queued operation.
    ///
    /// Dropping the future or firing `cancel` takes the operation out of the
    /// queue if it was not sent yet.
    async fn confirm(
        &self,
        partition: &Partition,
        kind: OpKind,
        id: u64,
        rx: oneshot::Receiver<Result<()>>,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let guard = scopeguard::guard((), |_| {
            if partition.cancel(kind, id) {
                log::debug!("{} {} {} removed from queue", self.client_id, kind, id);
            }
        });
        let res = match cancel {
            Some(token) => tokio::select! {
                res = rx => res,
                _ = token.cancelled() => return Err(MqttError::Canceled),
            },
            None => rx.await,
        };
        scopeguard::ScopeGuard::into_inner(guard);
        res.unwrap_or(Err(MqttError::Closed))
    }
}

/// Removes its registration when dropped or on [`SubscriptionHandle::unsubscribe`].
pub struct SubscriptionHandle {
    id: SubscriptionId,
    filter: TopicFilter,
    client: Weak<ClientInner>,
    active: bool,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle").field("id", &self.id).field("filter", &self.filter).finish()
    }
}

impl SubscriptionHandle {
    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[inline]
    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    pub fn unsubscribe(mut self) -> Result<()> {
        self.active = false;
        match self.client.upgrade() {
            Some(client) => client.remove_subscription(self.id),
            None => Ok(()),
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            if let Err(e) = client.remove_subscription(self.id) {
                log::warn!("{} unsubscribe {} failed, {}", client.client_id, self.filter, e);
            }
        }
    }
}

#[derive(Clone)]
pub struct MqttClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl MqttClient {
    /// Starts every partition in the background, see [`MqttClient::ready`].
    pub fn new(opts: MqttOptions, connector: WireConnectorRef) -> Self {
        let retry = retry::from_config(&opts.connection_retry);
        Self::with_retry_policy(opts, connector, retry)
    }

    pub fn with_retry_policy(opts: MqttOptions, connector: WireConnectorRef, retry: RetryPolicyRef) -> Self {
        let opts = Arc::new(opts.finalize());
        let client_id = ClientId::from(opts.client_id.as_str());
        let router = Arc::new(Router::new());
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        let shutdown = CancellationToken::new();

        let partitions = (0..opts.number_of_client_partitions)
            .map(|index| {
                Partition::start(
                    index,
                    opts.clone(),
                    connector.clone(),
                    retry.clone(),
                    router.clone(),
                    events.clone(),
                    shutdown.child_token(),
                )
            })
            .collect::<Vec<_>>();
        log::info!("{} client started with {} partition(s)", client_id, partitions.len());

        Self {
            inner: Arc::new(ClientInner {
                opts,
                client_id,
                partitions,
                router,
                calls: PendingCalls::default(),
                reply_subscription: OnceCell::new(),
                events,
                shutdown,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Starts the client and waits until it is ready.
    pub async fn start(opts: MqttOptions, connector: WireConnectorRef) -> Result<Self> {
        let client = Self::new(opts, connector);
        if let Err(e) = client.ready().await {
            if let Err(close_err) = client.close().await {
                log::warn!("{} close after failed start, {}", client.client_id(), close_err);
            }
            return Err(e);
        }
        Ok(client)
    }

    /// A client connected to a new in-process broker.
    pub fn in_memory(opts: MqttOptions) -> (Self, MemoryBroker) {
        let broker = MemoryBroker::new().strict_routing(opts.strict_routing);
        (Self::new(opts, Arc::new(broker.clone())), broker)
    }

    #[inline]
    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    #[inline]
    pub fn options(&self) -> &MqttOptions {
        &self.inner.opts
    }

    #[inline]
    pub fn partitions(&self) -> usize {
        self.inner.partitions.len()
    }

    #[inline]
    pub fn partition_for(&self, topic: &str) -> PartitionIndex {
        partition_for(topic, self.inner.partitions.len())
    }

    #[inline]
    pub fn state(&self, partition: PartitionIndex) -> Option<ConnectionState> {
        self.inner.partitions.get(partition).map(|p| p.state())
    }

    #[inline]
    pub fn states(&self) -> Vec<ConnectionState> {
        self.inner.partitions.iter().map(|p| p.state()).collect()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Waits until every partition has been connected at least once.
    pub async fn ready(&self) -> Result<()> {
        self.ready_timeout(self.inner.opts.startup_timeout).await
    }

    pub async fn ready_timeout(&self, timeout: Duration) -> Result<()> {
        let all = try_join_all(self.inner.partitions.iter().map(|p| p.ready()));
        match tokio::time::timeout(timeout, all).await {
            Ok(res) => res.map(|_| ()),
            Err(_) => Err(MqttError::ConnectingFailed(format!("not ready within {:?}", timeout))),
        }
    }

    /// Waits until `partition` is connected, right away if it already is.
    pub async fn connected(&self, partition: PartitionIndex) -> Result<()> {
        match self.inner.partitions.get(partition) {
            Some(p) => p.connected().await,
            None => Err(MqttError::from(format!("no partition {}", partition))),
        }
    }

    /// Registers `consumer` for `filter`, returns once the broker side
    /// subscription is queued.
    pub async fn subscribe<C>(&self, filter: &str, consumer: C) -> Result<SubscriptionHandle>
    where
        C: EventConsumer + 'static,
    {
        self.subscribe_with(filter, self.inner.opts.qos, Arc::new(consumer), false, None).await
    }

    /// Like [`MqttClient::subscribe`] but waits until the broker side
    /// subscription was sent.
    pub async fn subscribe_confirmed<C>(&self, filter: &str, consumer: C) -> Result<SubscriptionHandle>
    where
        C: EventConsumer + 'static,
    {
        self.subscribe_with(filter, self.inner.opts.qos, Arc::new(consumer), true, None).await
    }

    pub async fn subscribe_with(
        &self,
        filter: &str,
        qos: QoS,
        consumer: EventConsumerRef,
        confirm: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<SubscriptionHandle> {
        self.inner.check_closed()?;
        if !topic::is_valid(Some(filter)) {
            return Err(MqttError::InvalidFilter(TopicError::InvalidTopic(filter.into())));
        }
        let owner = partition_for(filter, self.inner.partitions.len());
        let (id, first) = self.inner.router.add(filter, qos, owner, consumer)?;
        let handle = SubscriptionHandle {
            id,
            filter: TopicFilter::from(filter),
            client: Arc::downgrade(&self.inner),
            active: true,
        };
        log::debug!("{} subscribe {}, id: {}, first: {}", self.client_id(), filter, id, first);
        if !first {
            return Ok(handle);
        }

        let partition = self.inner.partition(filter);
        let op = Operation::Subscribe(handle.filter.clone(), qos);
        if confirm {
            let (tx, rx) = oneshot::channel();
            let op_id = partition.enqueue(op, Some(tx))?;
            self.inner.confirm(partition, OpKind::Subscribe, op_id, rx, cancel).await?;
        } else {
            partition.enqueue(op, None)?;
        }
        Ok(handle)
    }

    #[inline]
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        handle.unsubscribe()
    }

    /// Queues `msg`, the send itself happens in the background.
    pub async fn publish(&self, msg: Message) -> Result<()> {
        self.inner.check_closed()?;
        if !topic::is_valid_name(&msg.topic) {
            return Err(MqttError::InvalidFilter(TopicError::InvalidTopic(msg.topic.to_string())));
        }
        self.inner.partition(&msg.topic).enqueue(Operation::Publish(msg), None)?;
        Ok(())
    }

    /// Queues `msg` and waits until it was handed to the broker.
    pub async fn publish_confirmed(&self, msg: Message) -> Result<()> {
        self.publish_confirmed_with(msg, None).await
    }

    pub async fn publish_confirmed_with(&self, msg: Message, cancel: Option<&CancellationToken>) -> Result<()> {
        self.inner.check_closed()?;
        if !topic::is_valid_name(&msg.topic) {
            return Err(MqttError::InvalidFilter(TopicError::InvalidTopic(msg.topic.to_string())));
        }
        let partition = self.inner.partition(&msg.topic);
        let (tx, rx) = oneshot::channel();
        let id = partition.enqueue(Operation::Publish(msg), Some(tx))?;
        self.inner.confirm(partition, OpKind::Publish, id, rx, cancel).await
    }

    /// Closes every partition, a failing partition does not stop the others.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("{} closing", self.client_id());
        self.inner.calls.close();
        let results = join_all(self.inner.partitions.iter().map(|p| p.close())).await;
        self.inner.shutdown.cancel();
        self.inner.router.clear();
        let mut first_err = None;
        for (index, res) in results.into_iter().enumerate() {
            if let Err(e) = res {
                log::warn!("{} partition {} close failed, {}", self.client_id(), index, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> serde_json::Value {
        json!({
            "client_id": &*self.inner.client_id,
            "closed": self.is_closed(),
            "partitions": self.inner.partitions.iter().map(|p| p.to_json()).collect::<Vec<_>>(),
            "router": self.inner.router.to_json(),
            "pending_calls": self.inner.calls.len(),
        })
    }
}
