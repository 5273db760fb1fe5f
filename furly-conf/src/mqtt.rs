use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use furly_utils::{deserialize_duration, serialize_duration};

/// Delivery guarantee requested from the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum QoS {
    AtMostOnce = 0,
    #[default]
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(format!("invalid qos value {v}")),
        }
    }
}

impl Serialize for QoS {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.value())
    }
}

impl<'de> Deserialize<'de> for QoS {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        QoS::try_from(u8::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

/// What a full outbound queue does with the next item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Evict the head of the queue and accept the new item.
    #[serde(alias = "DropOldestQueuedMessage")]
    DropOldestQueuedMessage,
    /// Reject the new item, the queue is left unchanged.
    #[default]
    #[serde(alias = "DropNewMessage")]
    DropNewMessage,
}

impl fmt::Display for OverflowStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowStrategy::DropOldestQueuedMessage => f.write_str("drop_oldest_queued_message"),
            OverflowStrategy::DropNewMessage => f.write_str("drop_new_message"),
        }
    }
}

/// Connection retry configuration, `max_attempts = 0` retries forever
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryConfig {
    Fixed {
        #[serde(
            default = "RetryConfig::interval_default",
            deserialize_with = "deserialize_duration",
            serialize_with = "serialize_duration"
        )]
        interval: Duration,
        #[serde(default)]
        max_attempts: u32,
    },
    Exponential {
        #[serde(
            default = "RetryConfig::initial_default",
            deserialize_with = "deserialize_duration",
            serialize_with = "serialize_duration"
        )]
        initial: Duration,
        #[serde(
            default = "RetryConfig::max_default",
            deserialize_with = "deserialize_duration",
            serialize_with = "serialize_duration"
        )]
        max: Duration,
        #[serde(default = "RetryConfig::multiplier_default")]
        multiplier: f64,
        #[serde(default = "RetryConfig::jitter_default")]
        jitter: bool,
        #[serde(default)]
        max_attempts: u32,
    },
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::Exponential {
            initial: Self::initial_default(),
            max: Self::max_default(),
            multiplier: Self::multiplier_default(),
            jitter: Self::jitter_default(),
            max_attempts: 0,
        }
    }
}

impl RetryConfig {
    fn interval_default() -> Duration {
        Duration::from_secs(5)
    }
    fn initial_default() -> Duration {
        Duration::from_secs(1)
    }
    fn max_default() -> Duration {
        Duration::from_secs(30)
    }
    fn multiplier_default() -> f64 {
        2.0
    }
    fn jitter_default() -> bool {
        true
    }

    #[inline]
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryConfig::Fixed { max_attempts, .. } | RetryConfig::Exponential { max_attempts, .. } => {
                *max_attempts
            }
        }
    }

    #[inline]
    pub fn is_bounded(&self) -> bool {
        self.max_attempts() > 0
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqttOptions {
    #[serde(default = "MqttOptions::host_name_default")]
    pub host_name: String,
    #[serde(default = "MqttOptions::port_default")]
    pub port: u16,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    //Empty means a random id is generated when the options are finalized.
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub qos: QoS,
    #[serde(
        default = "MqttOptions::keep_alive_default",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub keep_alive: Duration,

    //Capacity of each outbound queue (publish, subscribe, unsubscribe) per partition.
    #[serde(default = "MqttOptions::max_pending_messages_default")]
    pub max_pending_messages: usize,
    #[serde(default)]
    pub overflow_strategy: OverflowStrategy,

    #[serde(default)]
    pub connection_retry: RetryConfig,
    //When false the first failed connection attempt faults the partition.
    #[serde(default = "MqttOptions::retry_on_first_connect_default")]
    pub retry_on_first_connect: bool,
    #[serde(
        default = "MqttOptions::connection_attempt_timeout_default",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub connection_attempt_timeout: Duration,
    #[serde(default, deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub session_expiry: Duration,
    #[serde(default = "MqttOptions::clean_start_default")]
    pub clean_start: bool,
    #[serde(default = "MqttOptions::number_of_client_partitions_default")]
    pub number_of_client_partitions: usize,
    #[serde(
        default = "MqttOptions::startup_timeout_default",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub startup_timeout: Duration,

    #[serde(
        default = "MqttOptions::default_method_call_timeout_default",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub default_method_call_timeout: Duration,
    #[serde(default)]
    pub method_call_timeout_retries: u32,
    #[serde(default = "MqttOptions::reply_topic_root_default")]
    pub reply_topic_root: String,

    //Broker-less configurations report publishes nobody subscribed to.
    #[serde(default)]
    pub strict_routing: bool,
}

impl Default for MqttOptions {
    fn default() -> Self {
        Self {
            host_name: Self::host_name_default(),
            port: Self::port_default(),
            user_name: None,
            password: None,
            use_tls: false,
            client_id: String::new(),
            qos: QoS::default(),
            keep_alive: Self::keep_alive_default(),
            max_pending_messages: Self::max_pending_messages_default(),
            overflow_strategy: OverflowStrategy::default(),
            connection_retry: RetryConfig::default(),
            retry_on_first_connect: Self::retry_on_first_connect_default(),
            connection_attempt_timeout: Self::connection_attempt_timeout_default(),
            session_expiry: Duration::ZERO,
            clean_start: Self::clean_start_default(),
            number_of_client_partitions: Self::number_of_client_partitions_default(),
            startup_timeout: Self::startup_timeout_default(),
            default_method_call_timeout: Self::default_method_call_timeout_default(),
            method_call_timeout_retries: 0,
            reply_topic_root: Self::reply_topic_root_default(),
            strict_routing: false,
        }
    }
}

impl MqttOptions {
    fn host_name_default() -> String {
        "localhost".into()
    }
    fn port_default() -> u16 {
        1883
    }
    fn keep_alive_default() -> Duration {
        Duration::from_secs(60)
    }
    fn max_pending_messages_default() -> usize {
        10_000
    }
    fn retry_on_first_connect_default() -> bool {
        true
    }
    fn connection_attempt_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
    fn clean_start_default() -> bool {
        true
    }
    fn number_of_client_partitions_default() -> usize {
        1
    }
    fn startup_timeout_default() -> Duration {
        Duration::from_secs(60)
    }
    fn default_method_call_timeout_default() -> Duration {
        Duration::from_secs(30)
    }
    fn reply_topic_root_default() -> String {
        "$furly/replies".into()
    }

    /// Fills in derived values: a random client id when none is configured and
    /// at least one partition.
    #[inline]
    pub fn finalize(mut self) -> Self {
        if self.client_id.is_empty() {
            self.client_id = format!("furly-{}", uuid::Uuid::new_v4().simple());
        }
        if self.number_of_client_partitions == 0 {
            log::warn!("number_of_client_partitions is 0, using 1");
            self.number_of_client_partitions = 1;
        }
        if self.max_pending_messages == 0 {
            log::warn!("max_pending_messages is 0, using 1");
            self.max_pending_messages = 1;
        }
        self
    }

    #[inline]
    pub fn partition_client_id(&self, index: usize) -> String {
        if self.number_of_client_partitions <= 1 {
            self.client_id.clone()
        } else {
            format!("{}_{}", self.client_id, index)
        }
    }

    /// The broker keeps session state across reconnects with these options.
    #[inline]
    pub fn session_persistent(&self) -> bool {
        !self.clean_start && !self.session_expiry.is_zero()
    }

    #[inline]
    pub fn server_addr(&self) -> String {
        let scheme = if self.use_tls { "tls" } else { "tcp" };
        format!("{}://{}:{}", scheme, self.host_name, self.port)
    }
}
