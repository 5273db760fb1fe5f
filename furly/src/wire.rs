//! The seam to the underlying MQTT protocol implementation.
//!
//! Framing, sockets and TLS live behind [`WireConnector`]; the session layer
//! only needs connect, publish, subscribe, unsubscribe and the inbound stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use furly_conf::MqttOptions;

use crate::types::{ClientId, Message, QoS};
use crate::Result;

/// Parameters of one physical connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: ClientId,
    pub host_name: String,
    pub port: u16,
    pub user_name: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub keep_alive: Duration,
    pub clean_start: bool,
    pub session_expiry: Duration,
}

impl ConnectOptions {
    pub fn new(opts: &MqttOptions, partition: usize) -> Self {
        Self {
            client_id: ClientId::from(opts.partition_client_id(partition)),
            host_name: opts.host_name.clone(),
            port: opts.port,
            user_name: opts.user_name.clone(),
            password: opts.password.clone(),
            use_tls: opts.use_tls,
            keep_alive: opts.keep_alive,
            clean_start: opts.clean_start,
            session_expiry: opts.session_expiry,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectAck {
    /// The broker resumed a session kept from a previous connection
    pub session_present: bool,
}

#[derive(Debug)]
pub enum WireEvent {
    Message(Message),
    Disconnected(Option<String>),
}

pub type WireEventSender = mpsc::UnboundedSender<WireEvent>;
pub type WireEventReceiver = mpsc::UnboundedReceiver<WireEvent>;

/// An established connection.
///
/// Errors for which [`crate::MqttError::is_connection_error`] holds
/// invalidate the connection; any other error only rejects the operation.
#[async_trait]
pub trait WireClient: Send + Sync {
    async fn publish(&self, msg: Message) -> Result<()>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()>;

    async fn unsubscribe(&self, filter: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

pub type WireClientBox = Box<dyn WireClient>;

#[async_trait]
pub trait WireConnector: Send + Sync {
    /// Opens a connection, inbound traffic and the disconnect notice go to `events`.
    async fn connect(&self, opts: &ConnectOptions, events: WireEventSender) -> Result<(WireClientBox, ConnectAck)>;
}

pub type WireConnectorRef = Arc<dyn WireConnector>;
