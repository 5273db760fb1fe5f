use furly_conf::OverflowStrategy;

use crate::queue::OpKind;
use crate::topic::TopicError;

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// A bounded outbound queue rejected or evicted the operation
    #[error("{kind} queue overflow, strategy: {strategy}")]
    QueueOverflow { kind: OpKind, strategy: OverflowStrategy },
    /// A single connection attempt was refused or failed
    #[error("connecting failed, {0}")]
    ConnectingFailed(String),
    /// A single connection attempt exceeded the attempt timeout
    #[error("connection attempt timed out")]
    ConnectTimeout,
    /// Broker discarded the session state, messages may have been missed
    #[error("session expired")]
    SessionExpired,
    #[error("connection lost, {0}")]
    Wire(String),
    #[error("not connected")]
    NotConnected,
    #[error("client closed")]
    Closed,
    #[error("invalid topic filter, {0}")]
    InvalidFilter(#[from] TopicError),
    #[error("no subscriber for topic `{0}`")]
    Unroutable(String),
    #[error("method call failed, {0}")]
    MethodCall(String),
    #[error("method call returned status {status}, {message}")]
    MethodCallStatus { status: u16, message: String },
    #[error("method call timed out after {attempts} attempt(s)")]
    MethodCallTimeout { attempts: u32 },
    #[error("operation canceled")]
    Canceled,
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl MqttError {
    /// Errors that invalidate the physical connection, as opposed to errors
    /// that only reject a single operation.
    #[inline]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MqttError::Wire(_) | MqttError::NotConnected | MqttError::ConnectingFailed(_) | MqttError::ConnectTimeout
        )
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, MqttError::MethodCallTimeout { .. } | MqttError::ConnectTimeout)
    }

    /// Status code carried back to an RPC caller for this error.
    #[inline]
    pub fn status(&self) -> u16 {
        match self {
            MqttError::MethodCallStatus { status, .. } => *status,
            MqttError::InvalidFilter(_) => 400,
            MqttError::Unroutable(_) => 404,
            MqttError::MethodCallTimeout { .. } | MqttError::ConnectTimeout => 408,
            MqttError::QueueOverflow { .. } => 503,
            _ => 500,
        }
    }
}

impl From<String> for MqttError {
    #[inline]
    fn from(e: String) -> Self {
        MqttError::Anyhow(anyhow::Error::msg(e))
    }
}

impl From<&str> for MqttError {
    #[inline]
    fn from(e: &str) -> Self {
        MqttError::Anyhow(anyhow::Error::msg(e.to_owned()))
    }
}

pub type Result<T, E = MqttError> = std::result::Result<T, E>;
