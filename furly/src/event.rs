use async_trait::async_trait;
use bytes::Bytes;
use bytestring::ByteString;
use tokio_util::sync::CancellationToken;

use crate::client::{MqttClient, SubscriptionHandle};
use crate::router::EventConsumerRef;
use crate::types::{ContentType, Message, MessageProperties, QoS, TopicName, UserProperties};
use crate::{MqttError, Result};

/// Collects the parts of an event, [`EventBuilder::build`] turns them into
/// one immutable message per buffer.
#[derive(Clone)]
pub struct EventBuilder {
    client: MqttClient,
    topic: Option<TopicName>,
    content_type: Option<ContentType>,
    content_encoding: Option<ByteString>,
    properties: UserProperties,
    buffers: Vec<Bytes>,
    qos: QoS,
    retain: bool,
}

impl EventBuilder {
    pub fn new(client: MqttClient) -> Self {
        let qos = client.options().qos;
        Self {
            client,
            topic: None,
            content_type: None,
            content_encoding: None,
            properties: Vec::new(),
            buffers: Vec::new(),
            qos,
            retain: false,
        }
    }

    #[inline]
    pub fn topic<T: Into<TopicName>>(mut self, topic: T) -> Self {
        self.topic = Some(topic.into());
        self
    }

    #[inline]
    pub fn content_type<C: Into<ContentType>>(mut self, content_type: C) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[inline]
    pub fn content_encoding<E: Into<ByteString>>(mut self, encoding: E) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    #[inline]
    pub fn property<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<ByteString>,
        V: Into<ByteString>,
    {
        self.properties.push((key.into(), value.into()));
        self
    }

    #[inline]
    pub fn buffer<B: Into<Bytes>>(mut self, buffer: B) -> Self {
        self.buffers.push(buffer.into());
        self
    }

    pub fn buffers<I, B>(mut self, buffers: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.buffers.extend(buffers.into_iter().map(Into::into));
        self
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

    /// Without buffers the event is a single empty message.
    pub fn build(&self) -> Result<Vec<Message>> {
        let topic = self.topic.clone().ok_or_else(|| MqttError::from("event topic is not set"))?;
        if !crate::topic::is_valid_name(&topic) {
            return Err(MqttError::InvalidFilter(crate::topic::TopicError::InvalidTopic(topic.to_string())));
        }
        let properties = MessageProperties {
            content_type: self.content_type.clone(),
            content_encoding: self.content_encoding.clone(),
            response_topic: None,
            correlation_data: None,
            user_properties: self.properties.clone(),
        };
        let message = |payload: Bytes| Message {
            topic: topic.clone(),
            payload,
            qos: self.qos,
            retain: self.retain,
            properties: properties.clone(),
        };
        if self.buffers.is_empty() {
            Ok(vec![message(Bytes::new())])
        } else {
            Ok(self.buffers.iter().cloned().map(message).collect())
        }
    }

    /// Publishes the built messages in order.
    pub async fn send(self) -> Result<()> {
        for msg in self.build()? {
            self.client.publish(msg).await?;
        }
        Ok(())
    }

    /// Like [`EventBuilder::send`], waiting for each message to be handed to the broker.
    pub async fn send_confirmed(self, cancel: Option<&CancellationToken>) -> Result<()> {
        for msg in self.build()? {
            self.client.publish_confirmed_with(msg, cancel).await?;
        }
        Ok(())
    }
}

pub trait EventClient {
    fn event(&self) -> EventBuilder;
}

#[async_trait]
pub trait EventSubscriber {
    /// Registers `consumer` and waits until the broker confirmed the filter.
    ///
    /// Canceling `cancel` before that drops the registration again.
    async fn register(
        &self,
        filter: &str,
        consumer: EventConsumerRef,
        cancel: Option<&CancellationToken>,
    ) -> Result<SubscriptionHandle>;
}

impl EventClient for MqttClient {
    #[inline]
    fn event(&self) -> EventBuilder {
        EventBuilder::new(self.clone())
    }
}

#[async_trait]
impl EventSubscriber for MqttClient {
    #[inline]
    async fn register(
        &self,
        filter: &str,
        consumer: EventConsumerRef,
        cancel: Option<&CancellationToken>,
    ) -> Result<SubscriptionHandle> {
        if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
            return Err(MqttError::Canceled);
        }
        self.subscribe_with(filter, self.options().qos, consumer, true, cancel).await
    }
}
