//! Broker-less transport, publish and dispatch happen in the same process.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::topic::Topic;
use crate::types::{ClientId, DashMap, HashMap, Message, QoS, TopicFilter, TopicName};
use crate::wire::{
    ConnectAck, ConnectOptions, WireClient, WireClientBox, WireConnector, WireEvent, WireEventSender,
};
use crate::{MqttError, Result};

struct Connection {
    id: u64,
    events: WireEventSender,
}

struct Session {
    client_id: ClientId,
    persistent: bool,
    subscriptions: RwLock<HashMap<TopicFilter, (Topic, QoS)>>,
    conn: Mutex<Option<Connection>>,
}

impl Session {
    #[inline]
    fn is_online(&self, conn_id: u64) -> bool {
        self.conn.lock().as_ref().map(|c| c.id == conn_id).unwrap_or(false)
    }

    #[inline]
    fn take_conn(&self) -> Option<Connection> {
        self.conn.lock().take()
    }

    fn deliver(&self, msg: &Message, qos: QoS) -> bool {
        if let Some(c) = self.conn.lock().as_ref() {
            let msg = msg.clone().qos(qos.min(msg.qos));
            c.events.send(WireEvent::Message(msg)).is_ok()
        } else {
            false
        }
    }
}

#[derive(Default)]
struct Inner {
    sessions: DashMap<ClientId, Arc<Session>>,
    retained: DashMap<TopicName, Message>,
    published: DashMap<TopicName, usize>,
    next_conn_id: AtomicU64,
    connects: AtomicUsize,
    strict_routing: AtomicBool,
    refuse_connections: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
}

impl Inner {
    fn route(&self, msg: &Message) -> usize {
        if msg.retain {
            if msg.payload.is_empty() {
                self.retained.remove(&msg.topic);
            } else {
                self.retained.insert(msg.topic.clone(), msg.clone());
            }
        }

        let mut matched = 0;
        for entry in self.sessions.iter() {
            let session = entry.value();
            let qos = session
                .subscriptions
                .read()
                .values()
                .filter(|(topic, _)| topic.matches_str(&msg.topic))
                .map(|(_, qos)| *qos)
                .max();
            if let Some(qos) = qos {
                matched += 1;
                if !session.deliver(msg, qos) {
                    log::debug!("{} is offline, message to {} dropped", session.client_id, msg.topic);
                }
            }
        }
        matched
    }
}

/// An in-process MQTT broker.
///
/// Sessions are kept per client id when the client connects with
/// `clean_start = false` and a non-zero session expiry.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes matching no subscriber fail with [`MqttError::Unroutable`].
    pub fn strict_routing(self, strict: bool) -> Self {
        self.inner.strict_routing.store(strict, Ordering::SeqCst);
        self
    }

    #[inline]
    pub fn set_strict_routing(&self, strict: bool) {
        self.inner.strict_routing.store(strict, Ordering::SeqCst);
    }

    #[inline]
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Delays every connection handshake, `None` answers immediately.
    #[inline]
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.inner.connect_delay.lock() = delay;
    }

    /// Drops the connection of `client_id`, its session is kept if persistent.
    pub fn kick(&self, client_id: &str) -> bool {
        let session = self.inner.sessions.get(client_id).map(|s| s.value().clone());
        let Some(session) = session else {
            return false;
        };
        let conn = session.take_conn();
        if !session.persistent {
            self.inner.sessions.remove(client_id);
        }
        match conn {
            Some(c) => {
                log::debug!("{} kicked", client_id);
                let _ = c.events.send(WireEvent::Disconnected(Some("kicked".into())));
                true
            }
            None => false,
        }
    }

    pub fn kick_all(&self) -> usize {
        let ids = self.inner.sessions.iter().map(|e| e.key().clone()).collect::<Vec<_>>();
        ids.iter().filter(|id| self.kick(id)).count()
    }

    /// Discards the session state of `client_id` and drops its connection.
    pub fn expire_session(&self, client_id: &str) -> bool {
        match self.inner.sessions.remove(client_id) {
            Some((_, session)) => {
                if let Some(c) = session.take_conn() {
                    let _ = c.events.send(WireEvent::Disconnected(Some("session expired".into())));
                }
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.inner.sessions.get(client_id).map(|s| s.conn.lock().is_some()).unwrap_or(false)
    }

    pub fn subscriptions(&self, client_id: &str) -> Vec<TopicFilter> {
        let mut filters = self
            .inner
            .sessions
            .get(client_id)
            .map(|s| s.subscriptions.read().keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        filters.sort();
        filters
    }

    /// Number of successful connection handshakes.
    #[inline]
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Number of publishes accepted for `topic`.
    #[inline]
    pub fn published(&self, topic: &str) -> usize {
        self.inner.published.get(topic).map(|c| *c).unwrap_or_default()
    }

    /// Publishes from outside any client session.
    pub fn publish(&self, msg: Message) -> Result<usize> {
        *self.inner.published.entry(msg.topic.clone()).or_default() += 1;
        let matched = self.inner.route(&msg);
        if matched == 0 && self.inner.strict_routing.load(Ordering::SeqCst) {
            return Err(MqttError::Unroutable(msg.topic.to_string()));
        }
        Ok(matched)
    }
}

#[async_trait]
impl WireConnector for MemoryBroker {
    async fn connect(&self, opts: &ConnectOptions, events: WireEventSender) -> Result<(WireClientBox, ConnectAck)> {
        let delay = *self.inner.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectingFailed(format!("{} connection refused", opts.client_id)));
        }

        let persistent = !opts.clean_start && !opts.session_expiry.is_zero();
        let existing = self.inner.sessions.get(&opts.client_id).map(|s| s.value().clone());
        if let Some(c) = existing.as_ref().and_then(|s| s.take_conn()) {
            let _ = c.events.send(WireEvent::Disconnected(Some("session taken over".into())));
        }

        let (session, session_present) = match existing {
            Some(s) if !opts.clean_start && s.persistent => (s, true),
            _ => {
                let s = Arc::new(Session {
                    client_id: opts.client_id.clone(),
                    persistent,
                    subscriptions: RwLock::new(HashMap::default()),
                    conn: Mutex::new(None),
                });
                self.inner.sessions.insert(opts.client_id.clone(), s.clone());
                (s, false)
            }
        };

        let id = self.inner.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
        *session.conn.lock() = Some(Connection { id, events });
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        log::debug!("{} connected to memory broker, session_present: {}", opts.client_id, session_present);

        let client = MemoryWireClient { broker: self.clone(), session, id };
        Ok((Box::new(client), ConnectAck { session_present }))
    }
}

struct MemoryWireClient {
    broker: MemoryBroker,
    session: Arc<Session>,
    id: u64,
}

impl MemoryWireClient {
    #[inline]
    fn online(&self) -> Result<()> {
        if self.session.is_online(self.id) {
            Ok(())
        } else {
            Err(MqttError::NotConnected)
        }
    }
}

#[async_trait]
impl WireClient for MemoryWireClient {
    async fn publish(&self, msg: Message) -> Result<()> {
        self.online()?;
        self.broker.publish(msg).map(|_| ())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        self.online()?;
        let topic = filter.parse::<Topic>()?;
        self.session.subscriptions.write().insert(TopicFilter::from(filter), (topic.clone(), qos));
        let retained = self
            .broker
            .inner
            .retained
            .iter()
            .filter(|e| topic.matches_str(e.key()))
            .map(|e| e.value().clone())
            .collect::<Vec<_>>();
        for msg in retained {
            self.session.deliver(&msg, qos);
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.online()?;
        self.session.subscriptions.write().remove(filter);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let conn = {
            let mut conn = self.session.conn.lock();
            match conn.as_ref() {
                Some(c) if c.id == self.id => conn.take(),
                _ => None,
            }
        };
        if conn.is_some() && !self.session.persistent {
            self.broker.inner.sessions.remove_if(&self.session.client_id, |_, s| Arc::ptr_eq(s, &self.session));
        }
        Ok(())
    }
}
