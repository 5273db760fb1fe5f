//! Request/response on top of publish/subscribe.
//!
//! A request goes to `{target}/{escaped method}` and carries a correlation id
//! plus the caller's reply topic as message properties. The reply comes back
//! on the reply topic with the same correlation id and a `status` user
//! property. Timed out attempts are republished with the same correlation id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::client::{MqttClient, SubscriptionHandle};
use crate::topic;
use crate::types::{ContentType, CorrelationId, DashMap, Message, TopicName};
use crate::{MqttError, Result};

pub const STATUS_PROPERTY: &str = "status";
pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_METHOD_NOT_ALLOWED: u16 = 405;

type ReplySender = oneshot::Sender<Result<Message>>;

/// Outstanding calls keyed by correlation id.
#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: DashMap<CorrelationId, ReplySender>,
}

impl PendingCalls {
    fn register(&self, id: CorrelationId) -> Result<oneshot::Receiver<Result<Message>>> {
        let (tx, rx) = oneshot::channel();
        match self.calls.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(o) => {
                Err(MqttError::MethodCall(format!("correlation id {:?} is in use", o.key())))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(tx);
                Ok(rx)
            }
        }
    }

    /// Resolves the call waiting for `id`, false if there is none.
    fn complete(&self, id: &CorrelationId, reply: Result<Message>) -> bool {
        match self.calls.remove(id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    #[inline]
    fn remove(&self, id: &CorrelationId) -> bool {
        self.calls.remove(id).is_some()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }

    pub(crate) fn close(&self) {
        let ids = self.calls.iter().map(|e| e.key().clone()).collect::<Vec<_>>();
        for id in ids {
            self.complete(&id, Err(MqttError::Closed));
        }
    }
}

#[derive(Debug, Clone)]
pub struct MethodCall {
    pub target: String,
    pub method: String,
    pub payload: Bytes,
    pub content_type: Option<ContentType>,
    /// Per attempt timeout, the client default when unset
    pub timeout: Option<Duration>,
    /// Republish count after a timeout, the client default when unset
    pub retries: Option<u32>,
}

impl MethodCall {
    pub fn new<T, M, P>(target: T, method: M, payload: P) -> Self
    where
        T: Into<String>,
        M: Into<String>,
        P: Into<Bytes>,
    {
        Self {
            target: target.into(),
            method: method.into(),
            payload: payload.into(),
            content_type: None,
            timeout: None,
            retries: None,
        }
    }

    #[inline]
    pub fn content_type<C: Into<ContentType>>(mut self, content_type: C) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[inline]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[inline]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Topic a request for `method` on `target` is published to.
#[inline]
pub fn request_topic(target: &str, method: &str) -> TopicName {
    TopicName::from(format!("{}/{}", target, topic::escape(method)))
}

/// Server side of a method call.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Requests are accepted on `{mount_point}/{method}`.
    fn mount_point(&self) -> &str;

    async fn invoke(
        &self,
        method: &str,
        payload: Bytes,
        content_type: Option<ContentType>,
        cancel: CancellationToken,
    ) -> Result<Bytes>;
}

pub type MethodHandlerRef = Arc<dyn MethodHandler>;

/// Keeps a handler connected, dropping it unsubscribes and cancels running invocations.
pub struct ServerRegistration {
    subscription: SubscriptionHandle,
    _cancel: DropGuard,
}

impl ServerRegistration {
    #[inline]
    pub fn filter(&self) -> &str {
        self.subscription.filter()
    }

    pub fn close(self) -> Result<()> {
        let ServerRegistration { subscription, _cancel } = self;
        subscription.unsubscribe()
    }
}

#[async_trait]
pub trait RpcClient {
    async fn call_method(&self, call: MethodCall, cancel: Option<&CancellationToken>) -> Result<Bytes>;
}

#[async_trait]
pub trait RpcServer {
    async fn connect(&self, handler: MethodHandlerRef, cancel: Option<&CancellationToken>)
        -> Result<ServerRegistration>;
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => futures::future::pending::<()>().await,
    }
}

fn reply_status(reply: &Message) -> u16 {
    reply.properties.user_property(STATUS_PROPERTY).and_then(|s| s.parse::<u16>().ok()).unwrap_or(STATUS_OK)
}

impl MqttClient {
    /// Topic replies to this client arrive on.
    #[inline]
    pub fn reply_topic(&self) -> TopicName {
        let opts = &self.inner.opts;
        TopicName::from(format!("{}/{}", opts.reply_topic_root.trim_end_matches('/'), topic::escape(&opts.client_id)))
    }

    async fn ensure_reply_subscription(&self, cancel: Option<&CancellationToken>) -> Result<TopicName> {
        let reply_topic = self.reply_topic();
        self.inner
            .reply_subscription
            .get_or_try_init(|| async {
                let client = Arc::downgrade(&self.inner);
                let consumer = move |msg: Message| {
                    let client = client.clone();
                    async move {
                        let Some(client) = client.upgrade() else {
                            return Ok(());
                        };
                        match msg.properties.correlation_data.clone() {
                            Some(id) => {
                                if !client.calls.complete(&id, Ok(msg)) {
                                    log::debug!("unmatched reply {:?} discarded", id);
                                }
                            }
                            None => log::warn!("reply on {} without correlation data", msg.topic),
                        }
                        Ok::<(), MqttError>(())
                    }
                };
                self.subscribe_with(&reply_topic, self.inner.opts.qos, Arc::new(consumer), true, cancel).await
            })
            .await?;
        Ok(reply_topic)
    }

    async fn call(&self, call: MethodCall, cancel: Option<&CancellationToken>) -> Result<Bytes> {
        if self.is_closed() {
            return Err(MqttError::Closed);
        }
        let opts = &self.inner.opts;
        let timeout = call.timeout.unwrap_or(opts.default_method_call_timeout);
        let attempts = call.retries.unwrap_or(opts.method_call_timeout_retries).saturating_add(1);
        let reply_topic = self.ensure_reply_subscription(cancel).await?;

        let correlation_id = CorrelationId::copy_from_slice(Uuid::new_v4().as_bytes());
        let mut rx = self.inner.calls.register(correlation_id.clone())?;
        let _pending = scopeguard::guard(correlation_id.clone(), |id| {
            self.inner.calls.remove(&id);
        });

        let mut request = Message::new(request_topic(&call.target, &call.method), call.payload)
            .qos(opts.qos)
            .response_topic(reply_topic)
            .correlation_data(correlation_id.clone());
        if let Some(content_type) = call.content_type {
            request = request.content_type(content_type);
        }

        for attempt in 1..=attempts {
            log::debug!("{} call {}, attempt {}/{}", self.client_id(), request.topic, attempt, attempts);
            tokio::select! {
                res = self.publish(request.clone()) => res?,
                _ = cancelled(cancel) => return Err(MqttError::Canceled),
            }
            let reply = tokio::select! {
                reply = &mut rx => reply.map_err(|_| MqttError::Closed)?,
                _ = tokio::time::sleep(timeout) => {
                    log::warn!(
                        "{} call {} timed out, attempt {}/{}",
                        self.client_id(),
                        request.topic,
                        attempt,
                        attempts
                    );
                    continue;
                }
                _ = cancelled(cancel) => return Err(MqttError::Canceled),
            };
            let reply = reply?;
            let status = reply_status(&reply);
            return if (200..300).contains(&status) {
                Ok(reply.payload)
            } else {
                Err(MqttError::MethodCallStatus {
                    status,
                    message: String::from_utf8_lossy(&reply.payload).into_owned(),
                })
            };
        }
        Err(MqttError::MethodCallTimeout { attempts })
    }

    async fn serve(
        &self,
        handler: MethodHandlerRef,
        cancel: Option<&CancellationToken>,
    ) -> Result<ServerRegistration> {
        let mount_point = handler.mount_point().trim_end_matches('/').to_owned();
        let filter = format!("{}/+", mount_point);
        let token = CancellationToken::new();
        let client = Arc::downgrade(&self.inner);

        let consumer = {
            let token = token.clone();
            move |msg: Message| {
                let client = client.clone();
                let handler = handler.clone();
                let token = token.child_token();
                let prefix_len = mount_point.len() + 1;
                async move {
                    let Some(inner) = client.upgrade() else {
                        return Ok(());
                    };
                    let client = MqttClient { inner };
                    let (Some(reply_topic), Some(correlation_id)) =
                        (msg.properties.response_topic.clone(), msg.properties.correlation_data.clone())
                    else {
                        log::warn!("{} request on {} without reply topic", client.client_id(), msg.topic);
                        return Ok(());
                    };
                    tokio::spawn(async move {
                        let method = msg.topic.get(prefix_len..).map(topic::unescape);
                        let res = match method {
                            Some(Ok(method)) if !method.is_empty() => {
                                let content_type = msg.properties.content_type.clone();
                                handler.invoke(&method, msg.payload.clone(), content_type, token).await
                            }
                            Some(Err(e)) => Err(MqttError::MethodCallStatus {
                                status: STATUS_BAD_REQUEST,
                                message: e.to_string(),
                            }),
                            _ => Err(MqttError::MethodCallStatus {
                                status: STATUS_METHOD_NOT_ALLOWED,
                                message: format!("no method in {}", msg.topic),
                            }),
                        };
                        let (status, payload) = match res {
                            Ok(payload) => (STATUS_OK, payload),
                            Err(e) => {
                                log::debug!("{} request {} failed, {}", client.client_id(), msg.topic, e);
                                let status = e.status();
                                let message = match e {
                                    MqttError::MethodCallStatus { message, .. } => message,
                                    e => e.to_string(),
                                };
                                (status, Bytes::from(message))
                            }
                        };
                        let reply = Message::new(reply_topic, payload)
                            .qos(client.options().qos)
                            .correlation_data(correlation_id)
                            .user_property(STATUS_PROPERTY, status.to_string());
                        if let Err(e) = client.publish(reply).await {
                            log::warn!("{} reply to {} failed, {}", client.client_id(), msg.topic, e);
                        }
                    });
                    Ok::<(), MqttError>(())
                }
            }
        };

        let subscription = self.subscribe_with(&filter, self.inner.opts.qos, Arc::new(consumer), true, cancel).await?;
        log::info!("{} serving methods on {}", self.client_id(), filter);
        Ok(ServerRegistration { subscription, _cancel: token.drop_guard() })
    }
}

#[async_trait]
impl RpcClient for MqttClient {
    #[inline]
    async fn call_method(&self, call: MethodCall, cancel: Option<&CancellationToken>) -> Result<Bytes> {
        self.call(call, cancel).await
    }
}

#[async_trait]
impl RpcServer for MqttClient {
    #[inline]
    async fn connect(
        &self,
        handler: MethodHandlerRef,
        cancel: Option<&CancellationToken>,
    ) -> Result<ServerRegistration> {
        self.serve(handler, cancel).await
    }
}
