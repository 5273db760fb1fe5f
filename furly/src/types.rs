use std::fmt;

use bytes::Bytes;
use bytestring::ByteString;
use serde::Serialize;

pub use furly_conf::{OverflowStrategy, QoS};

use crate::queue::OpKind;

pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

pub type ClientId = ByteString;
///topic name
pub type TopicName = ByteString;
///topic filter
pub type TopicFilter = ByteString;
pub type ContentType = ByteString;
pub type PartitionIndex = usize;
pub type SubscriptionId = u64;
pub type CorrelationId = Bytes;
pub type UserProperties = Vec<(ByteString, ByteString)>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<ContentType>,
    pub content_encoding: Option<ByteString>,
    pub response_topic: Option<TopicName>,
    pub correlation_data: Option<CorrelationId>,
    pub user_properties: UserProperties,
}

impl MessageProperties {
    #[inline]
    pub fn user_property(&self, key: &str) -> Option<&str> {
        self.user_properties.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_ref())
    }
}

/// A finalized message, immutable once handed to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: TopicName,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: MessageProperties,
}

impl Message {
    #[inline]
    pub fn new<T, P>(topic: T, payload: P) -> Self
    where
        T: Into<TopicName>,
        P: Into<Bytes>,
    {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::default(),
            retain: false,
            properties: MessageProperties::default(),
        }
    }

    #[inline]
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    #[inline]
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[inline]
    pub fn content_type<C: Into<ContentType>>(mut self, content_type: C) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    #[inline]
    pub fn response_topic<T: Into<TopicName>>(mut self, topic: T) -> Self {
        self.properties.response_topic = Some(topic.into());
        self
    }

    #[inline]
    pub fn correlation_data(mut self, data: CorrelationId) -> Self {
        self.properties.correlation_data = Some(data);
        self
    }

    #[inline]
    pub fn user_property<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<ByteString>,
        V: Into<ByteString>,
    {
        self.properties.user_properties.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Faulted,
}

impl ConnectionState {
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    #[inline]
    pub fn is_faulted(&self) -> bool {
        matches!(self, ConnectionState::Faulted)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Notifications about the session, delivered on [`crate::client::MqttClient::events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StateChanged { partition: PartitionIndex, state: ConnectionState },
    /// The broker lost the session of a partition that asked for one to be kept.
    SessionExpired { partition: PartitionIndex },
    /// An item was rejected or evicted. `state` is the partition state at the time.
    QueueOverflow {
        partition: PartitionIndex,
        kind: OpKind,
        strategy: OverflowStrategy,
        state: ConnectionState,
    },
}
