//! Connection lifecycle of a single partition.
//!
//! A background task connects, replays subscriptions and drains the outbound
//! queues while connected. Any connection level failure moves the partition to
//! `Reconnecting` and the retry policy decides when, or whether, to try again.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use furly_conf::{MqttOptions, OverflowStrategy};

use crate::client::partition_for;
use crate::queue::{OpKind, Operation, Outbox, QueuedOperation, Waiter};
use crate::retry::RetryPolicyRef;
use crate::router::Router;
use crate::types::{ClientEvent, ClientId, ConnectionState, Message, PartitionIndex};
use crate::wire::{ConnectAck, ConnectOptions, WireClient, WireConnectorRef, WireEvent, WireEventReceiver};
use crate::{MqttError, Result};

enum Drained {
    Shutdown,
    Lost(MqttError),
}

pub struct Partition {
    index: PartitionIndex,
    partitions: usize,
    client_id: ClientId,
    opts: Arc<MqttOptions>,
    connect_opts: ConnectOptions,
    connector: WireConnectorRef,
    retry: RetryPolicyRef,
    router: Arc<Router>,
    outbox: Outbox,
    state: watch::Sender<ConnectionState>,
    connected_once: AtomicBool,
    fault: Mutex<Option<String>>,
    events: broadcast::Sender<ClientEvent>,
    inbound: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl Partition {
    pub(crate) fn start(
        index: PartitionIndex,
        opts: Arc<MqttOptions>,
        connector: WireConnectorRef,
        retry: RetryPolicyRef,
        router: Arc<Router>,
        events: broadcast::Sender<ClientEvent>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let on_overflow = {
            let events = events.clone();
            move |kind: OpKind, strategy: OverflowStrategy| {
                let state = *state_rx.borrow();
                let _ = events.send(ClientEvent::QueueOverflow { partition: index, kind, strategy, state });
            }
        };
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let connect_opts = ConnectOptions::new(&opts, index);

        let partition = Arc::new(Self {
            index,
            partitions: opts.number_of_client_partitions.max(1),
            client_id: connect_opts.client_id.clone(),
            outbox: Outbox::new(opts.max_pending_messages, opts.overflow_strategy, on_overflow),
            opts,
            connect_opts,
            connector,
            retry,
            router,
            state,
            connected_once: AtomicBool::new(false),
            fault: Mutex::new(None),
            events,
            inbound,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        });

        let run = tokio::spawn(partition.clone().run());
        let dispatch = tokio::spawn(partition.clone().dispatch_loop(inbound_rx));
        partition.tasks.lock().extend([run, dispatch]);
        partition
    }

    #[inline]
    pub fn index(&self) -> PartitionIndex {
        self.index
    }

    #[inline]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[inline]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    #[inline]
    pub fn has_connected(&self) -> bool {
        self.connected_once.load(Ordering::SeqCst)
    }

    /// Hands an operation to the outbound queue of its kind.
    pub fn enqueue(&self, op: Operation, waiter: Option<Waiter>) -> Result<u64> {
        if let Some(reason) = self.fault.lock().clone() {
            return Err(MqttError::ConnectingFailed(reason));
        }
        self.outbox.push(op, waiter)
    }

    /// Removes an operation that was not sent yet.
    #[inline]
    pub fn cancel(&self, kind: OpKind, id: u64) -> bool {
        self.outbox.remove(kind, id).is_some()
    }

    /// Resolves once the partition reached `Connected` at least once.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        loop {
            if self.has_connected() {
                return Ok(());
            }
            if rx.borrow_and_update().is_faulted() {
                return Err(self.fault_error());
            }
            if self.shutdown.is_cancelled() {
                return Err(MqttError::Closed);
            }
            tokio::select! {
                changed = rx.changed() => changed.map_err(|_| MqttError::Closed)?,
                _ = self.shutdown.cancelled() => return Err(MqttError::Closed),
            }
        }
    }

    /// Resolves on the next transition to, or right away while in, `Connected`.
    pub async fn connected(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = tokio::select! {
            state = rx.wait_for(|s| s.is_connected() || s.is_faulted()) => {
                state.map(|s| *s).map_err(|_| MqttError::Closed)?
            }
            _ = self.shutdown.cancelled() => return Err(MqttError::Closed),
        };
        if state.is_faulted() {
            Err(self.fault_error())
        } else {
            Ok(())
        }
    }

    #[inline]
    fn fault_error(&self) -> MqttError {
        MqttError::ConnectingFailed(self.fault.lock().clone().unwrap_or_else(|| "faulted".into()))
    }

    fn set_state(&self, state: ConnectionState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            log::debug!("{} state {} -> {}", self.client_id, prev, state);
            let _ = self.events.send(ClientEvent::StateChanged { partition: self.index, state });
        }
    }

    fn faulted(&self, err: &MqttError) {
        log::error!("{} giving up connecting to {}, {}", self.client_id, self.opts.server_addr(), err);
        let reason = err.to_string();
        *self.fault.lock() = Some(reason.clone());
        self.set_state(ConnectionState::Faulted);
        let n = self.outbox.close_with(|| MqttError::ConnectingFailed(reason.clone()));
        if n > 0 {
            log::warn!("{} dropped {} queued operation(s)", self.client_id, n);
        }
    }

    async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        let mut connected_before = false;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let (tx, mut rx) = mpsc::unbounded_channel();
            let timeout = self.opts.connection_attempt_timeout;
            let res = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                res = tokio::time::timeout(timeout, self.connector.connect(&self.connect_opts, tx)) => {
                    res.unwrap_or_else(|_| Err(MqttError::ConnectTimeout))
                }
            };

            let err = match res {
                Ok((wire, ack)) => {
                    attempt = 0;
                    self.connects.fetch_add(1, Ordering::SeqCst);
                    log::info!(
                        "{} Successfully connected to {}, session_present: {}",
                        self.client_id,
                        self.opts.server_addr(),
                        ack.session_present
                    );
                    let drained = self.serve(wire.as_ref(), &mut rx, ack, connected_before).await;
                    connected_before = true;
                    if let Err(e) = wire.disconnect().await {
                        log::debug!("{} disconnect, {}", self.client_id, e);
                    }
                    match drained {
                        Drained::Shutdown => break,
                        Drained::Lost(e) => {
                            self.disconnects.fetch_add(1, Ordering::SeqCst);
                            log::warn!("{} connection lost, {}", self.client_id, e);
                            e
                        }
                    }
                }
                Err(e) => {
                    log::warn!("{} Connect to {} fail, {}", self.client_id, self.opts.server_addr(), e);
                    e
                }
            };

            attempt = attempt.saturating_add(1);
            if !connected_before && attempt == 1 && !self.opts.retry_on_first_connect {
                self.faulted(&err);
                break;
            }
            let delay = match self.retry.next_delay(attempt, &err) {
                Some(delay) => delay,
                None => {
                    self.faulted(&err);
                    break;
                }
            };
            self.set_state(ConnectionState::Reconnecting);
            log::debug!("{} reconnecting in {:?}, attempt: {}", self.client_id, delay, attempt);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if !self.state().is_faulted() {
            self.set_state(ConnectionState::Disconnected);
        }
        log::info!("{} Exit partition {} connection loop", self.client_id, self.index);
    }

    async fn serve(
        &self,
        wire: &dyn WireClient,
        rx: &mut WireEventReceiver,
        ack: ConnectAck,
        connected_before: bool,
    ) -> Drained {
        if !ack.session_present {
            if connected_before && self.opts.session_persistent() {
                log::warn!("{} session expired, messages may have been missed", self.client_id);
                let _ = self.events.send(ClientEvent::SessionExpired { partition: self.index });
            }
            if let Err(e) = self.resubscribe(wire).await {
                return Drained::Lost(e);
            }
        }
        self.connected_once.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        self.drain(wire, rx).await
    }

    /// Subscribes every filter of this partition that has registrations.
    async fn resubscribe(&self, wire: &dyn WireClient) -> Result<()> {
        let filters = self
            .router
            .filters()
            .into_iter()
            .filter(|(f, _)| partition_for(f, self.partitions) == self.index)
            .collect::<Vec<_>>();
        for (filter, qos) in filters {
            log::debug!("{} resubscribe {}", self.client_id, filter);
            if let Err(e) = wire.subscribe(&filter, qos).await {
                if e.is_connection_error() {
                    return Err(e);
                }
                log::warn!("{} resubscribe {} failed, {}", self.client_id, filter, e);
            }
        }
        Ok(())
    }

    async fn drain(&self, wire: &dyn WireClient, rx: &mut WireEventReceiver) -> Drained {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Drained::Shutdown,
                ev = rx.recv() => match ev {
                    Some(WireEvent::Message(msg)) => {
                        if self.inbound.send(msg).is_err() {
                            log::warn!("{} inbound dispatch is closed", self.client_id);
                        }
                        continue;
                    }
                    Some(WireEvent::Disconnected(reason)) => {
                        let reason = reason.unwrap_or_else(|| "disconnected".into());
                        return Drained::Lost(MqttError::Wire(reason));
                    }
                    None => return Drained::Lost(MqttError::Wire("event stream closed".into())),
                },
                Some(item) = self.outbox.unsubscribes.pop() => item,
                Some(item) = self.outbox.subscribes.pop() => item,
                Some(item) = self.outbox.publishes.pop() => item,
            };
            if let Err(e) = self.forward(wire, item).await {
                return Drained::Lost(e);
            }
        }
    }

    /// Sends one queued operation, a connection error puts it back at the head.
    async fn forward(&self, wire: &dyn WireClient, item: QueuedOperation) -> Result<()> {
        let res = match &item.op {
            Operation::Publish(msg) => wire.publish(msg.clone()).await,
            Operation::Subscribe(filter, qos) => {
                if self.router.is_active(filter) {
                    let qos = self.router.qos(filter).unwrap_or(*qos);
                    wire.subscribe(filter, qos).await
                } else {
                    log::debug!("{} skip subscribe {}, no registration left", self.client_id, filter);
                    Ok(())
                }
            }
            Operation::Unsubscribe(filter) => {
                if self.router.is_active(filter) {
                    log::debug!("{} skip unsubscribe {}, registered again", self.client_id, filter);
                    Ok(())
                } else {
                    wire.unsubscribe(filter).await
                }
            }
        };
        match res {
            Ok(()) => {
                item.complete(Ok(()));
                Ok(())
            }
            Err(e) if e.is_connection_error() => {
                log::debug!("{} {} not sent, {}", self.client_id, item.op.kind(), e);
                self.outbox.requeue_front(item);
                Err(e)
            }
            Err(e) => {
                log::warn!("{} {} rejected, {}", self.client_id, item.op.kind(), e);
                item.complete(Err(e));
                Ok(())
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Message>) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let topic = msg.topic.clone();
            if self.router.dispatch(self.index, msg).await == 0 && self.opts.strict_routing {
                log::warn!("{} unroutable message on {}", self.client_id, topic);
            }
        }
    }

    /// Stops the background tasks and fails whatever is still queued.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut res = Ok(());
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("{} partition task failed, {:?}", self.client_id, e);
                res = Err(MqttError::from(anyhow!("partition {} task failed, {}", self.index, e)));
            }
        }
        let n = self.outbox.close();
        if n > 0 {
            log::warn!("{} closed with {} queued operation(s)", self.client_id, n);
        }
        if !self.state().is_faulted() {
            self.set_state(ConnectionState::Disconnected);
        }
        res
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "partition": self.index,
            "client_id": &*self.client_id,
            "state": self.state(),
            "connected_once": self.has_connected(),
            "connects": self.connects.load(Ordering::SeqCst),
            "disconnects": self.disconnects.load(Ordering::SeqCst),
            "fault": self.fault.lock().clone(),
            "queues": self.outbox.to_json(),
        })
    }
}
