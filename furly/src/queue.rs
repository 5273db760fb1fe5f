use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};

use furly_conf::OverflowStrategy;
use furly_utils::{format_timestamp_millis, timestamp_millis, Counter, TimestampMillis};

use crate::types::{Message, QoS, TopicFilter};
use crate::{MqttError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Publish => f.write_str("publish"),
            OpKind::Subscribe => f.write_str("subscribe"),
            OpKind::Unsubscribe => f.write_str("unsubscribe"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Publish(Message),
    Subscribe(TopicFilter, QoS),
    Unsubscribe(TopicFilter),
}

impl Operation {
    #[inline]
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Publish(_) => OpKind::Publish,
            Operation::Subscribe(..) => OpKind::Subscribe,
            Operation::Unsubscribe(_) => OpKind::Unsubscribe,
        }
    }
}

pub type Waiter = oneshot::Sender<Result<()>>;

pub trait OnOverflowFn: 'static + Sync + Send + Fn(OpKind, OverflowStrategy) {}
impl<T> OnOverflowFn for T where T: 'static + Sync + Send + Fn(OpKind, OverflowStrategy) {}

pub struct QueuedOperation {
    pub(crate) id: u64,
    pub op: Operation,
    pub enqueue_time: TimestampMillis,
    waiter: Option<Waiter>,
}

impl fmt::Debug for QueuedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedOperation")
            .field("id", &self.id)
            .field("op", &self.op)
            .field("enqueue_time", &format_timestamp_millis(self.enqueue_time))
            .field("awaited", &self.waiter.is_some())
            .finish()
    }
}

impl QueuedOperation {
    /// Reports the outcome to whoever awaits delivery of this operation.
    #[inline]
    pub fn complete(self, res: Result<()>) {
        if let Some(waiter) = self.waiter {
            //the caller may have stopped waiting
            let _ = waiter.send(res);
        }
    }

    #[inline]
    fn overflow(self, strategy: OverflowStrategy) {
        let kind = self.op.kind();
        self.complete(Err(MqttError::QueueOverflow { kind, strategy }));
    }
}

struct Inner {
    items: VecDeque<QueuedOperation>,
    closed: bool,
}

/// Bounded FIFO of one operation kind, many producers and a single consumer.
pub struct Queue {
    kind: OpKind,
    cap: usize,
    strategy: OverflowStrategy,
    inner: Mutex<Inner>,
    notify: Notify,
    next_id: AtomicU64,
    depth: Counter,
    on_overflow_fn: Option<Arc<dyn OnOverflowFn>>,
}

impl Drop for Queue {
    #[inline]
    fn drop(&mut self) {
        log::debug!("{} queue drop ... len: {}", self.kind, self.len());
    }
}

impl Queue {
    #[inline]
    pub fn new(kind: OpKind, cap: usize, strategy: OverflowStrategy) -> Self {
        Self {
            kind,
            cap: cap.max(1),
            strategy,
            inner: Mutex::new(Inner { items: VecDeque::new(), closed: false }),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
            depth: Counter::new(),
            on_overflow_fn: None,
        }
    }

    #[inline]
    pub fn on_overflow<F>(mut self, f: F) -> Self
    where
        F: OnOverflowFn,
    {
        self.on_overflow_fn = Some(Arc::new(f));
        self
    }

    #[inline]
    fn overflowed(&self) {
        log::warn!("{} queue is full, capacity: {}, strategy: {}", self.kind, self.cap, self.strategy);
        if let Some(f) = self.on_overflow_fn.as_ref() {
            f(self.kind, self.strategy);
        }
    }

    /// Appends an operation, returning its id.
    ///
    /// If the queue is full the overflow strategy decides: the new item is
    /// rejected, or the head is evicted and its waiter is told so.
    pub fn push(&self, op: Operation, waiter: Option<Waiter>) -> Result<u64> {
        debug_assert_eq!(op.kind(), self.kind);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let item = QueuedOperation { id, op, enqueue_time: timestamp_millis(), waiter };

        let evicted = {
            let mut inner = self.inner.lock();
            if inner.closed {
                drop(inner);
                item.complete(Err(MqttError::Closed));
                return Err(MqttError::Closed);
            }
            let evicted = if inner.items.len() >= self.cap {
                match self.strategy {
                    OverflowStrategy::DropNewMessage => {
                        drop(inner);
                        self.overflowed();
                        return Err(MqttError::QueueOverflow { kind: self.kind, strategy: self.strategy });
                    }
                    OverflowStrategy::DropOldestQueuedMessage => inner.items.pop_front(),
                }
            } else {
                None
            };
            inner.items.push_back(item);
            self.depth.set(inner.items.len() as isize);
            evicted
        };

        if let Some(evicted) = evicted {
            log::debug!("{} queue evicted {:?}", self.kind, evicted);
            self.overflowed();
            evicted.overflow(self.strategy);
        }
        self.notify.notify_one();
        Ok(id)
    }

    /// Puts an operation that could not be sent back at the head.
    ///
    /// When producers filled the queue in the meantime the operation fails
    /// with an overflow instead.
    pub fn requeue_front(&self, item: QueuedOperation) {
        let rejected = {
            let mut inner = self.inner.lock();
            if inner.closed {
                Some((item, MqttError::Closed))
            } else if inner.items.len() >= self.cap {
                Some((item, MqttError::QueueOverflow { kind: self.kind, strategy: self.strategy }))
            } else {
                inner.items.push_front(item);
                self.depth.set(inner.items.len() as isize);
                None
            }
        };
        match rejected {
            Some((item, e @ MqttError::QueueOverflow { .. })) => {
                self.overflowed();
                item.complete(Err(e));
            }
            Some((item, e)) => item.complete(Err(e)),
            None => self.notify.notify_one(),
        }
    }

    #[inline]
    pub fn try_pop(&self) -> Option<QueuedOperation> {
        let mut inner = self.inner.lock();
        let item = inner.items.pop_front();
        if item.is_some() {
            self.depth.set(inner.items.len() as isize);
        }
        item
    }

    /// Waits for the next operation, `None` once the queue is closed and empty.
    ///
    /// Cancel safe, an operation is only taken out of the queue when returned.
    pub async fn pop(&self) -> Option<QueuedOperation> {
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.inner.lock().closed {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Takes a still queued operation out, used when its caller gives up.
    #[inline]
    pub fn remove(&self, id: u64) -> Option<QueuedOperation> {
        let mut inner = self.inner.lock();
        let pos = inner.items.iter().position(|item| item.id == id)?;
        let item = inner.items.remove(pos);
        self.depth.set(inner.items.len() as isize);
        item
    }

    /// Closes the queue and fails every operation still in it.
    #[inline]
    pub fn close(&self) -> usize {
        self.close_with(|| MqttError::Closed)
    }

    pub fn close_with<F>(&self, reason: F) -> usize
    where
        F: Fn() -> MqttError,
    {
        let items = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            self.depth.set(0);
            std::mem::take(&mut inner.items)
        };
        let n = items.len();
        for item in items {
            item.complete(Err(reason()));
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
        n
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    #[inline]
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn depth(&self) -> &Counter {
        &self.depth
    }
}

/// The three queues of one partition, drained unsubscribe first, then
/// subscribe, then publish.
pub struct Outbox {
    pub unsubscribes: Queue,
    pub subscribes: Queue,
    pub publishes: Queue,
}

impl Outbox {
    pub fn new<F>(cap: usize, strategy: OverflowStrategy, on_overflow: F) -> Self
    where
        F: OnOverflowFn + Clone,
    {
        Self {
            unsubscribes: Queue::new(OpKind::Unsubscribe, cap, strategy).on_overflow(on_overflow.clone()),
            subscribes: Queue::new(OpKind::Subscribe, cap, strategy).on_overflow(on_overflow.clone()),
            publishes: Queue::new(OpKind::Publish, cap, strategy).on_overflow(on_overflow),
        }
    }

    #[inline]
    pub fn queue(&self, kind: OpKind) -> &Queue {
        match kind {
            OpKind::Publish => &self.publishes,
            OpKind::Subscribe => &self.subscribes,
            OpKind::Unsubscribe => &self.unsubscribes,
        }
    }

    #[inline]
    pub fn push(&self, op: Operation, waiter: Option<Waiter>) -> Result<u64> {
        self.queue(op.kind()).push(op, waiter)
    }

    #[inline]
    pub fn requeue_front(&self, item: QueuedOperation) {
        self.queue(item.op.kind()).requeue_front(item)
    }

    #[inline]
    pub fn remove(&self, kind: OpKind, id: u64) -> Option<QueuedOperation> {
        self.queue(kind).remove(id)
    }

    pub fn close(&self) -> usize {
        self.close_with(|| MqttError::Closed)
    }

    pub fn close_with<F>(&self, reason: F) -> usize
    where
        F: Fn() -> MqttError,
    {
        self.unsubscribes.close_with(&reason) + self.subscribes.close_with(&reason) + self.publishes.close_with(&reason)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.unsubscribes.len() + self.subscribes.len() + self.publishes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "unsubscribe": self.unsubscribes.depth().to_json(),
            "subscribe": self.subscribes.depth().to_json(),
            "publish": self.publishes.depth().to_json(),
        })
    }
}
