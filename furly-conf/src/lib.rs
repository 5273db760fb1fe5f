#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use anyhow::Result;
use config::{Config, File};
use serde::Deserialize;

pub use self::logging::Log;
pub use self::mqtt::{MqttOptions, OverflowStrategy, QoS, RetryConfig};

pub mod logging;
pub mod mqtt;

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub mqtt: MqttOptions,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    /// Loads `/etc/furly/furly.*`, `./furly.*`, the optional `cfg_name` file and
    /// `FURLY_<SECTION>__<KEY>` environment variables, later sources win.
    pub fn new(cfg_name: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/furly/furly").required(false))
            .add_source(File::with_name("furly").required(false));

        if let Some(cfg) = cfg_name {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("furly").prefix_separator("_").separator("__").try_parsing(true),
        );

        let mut inner: Inner = builder.build()?.try_deserialize()?;
        inner.mqtt = inner.mqtt.finalize();
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn from_options(mqtt: MqttOptions) -> Self {
        Self(Arc::new(Inner { log: Log::default(), mqtt: mqtt.finalize() }))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("client_id is {}", self.mqtt.client_id);
        log::info!("broker is {}", self.mqtt.server_addr());
        log::info!("number_of_client_partitions is {}", self.mqtt.number_of_client_partitions);
        log::info!(
            "max_pending_messages is {}, overflow_strategy is {}",
            self.mqtt.max_pending_messages,
            self.mqtt.overflow_strategy
        );
        log::info!("connection_retry is {:?}", self.mqtt.connection_retry);
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_load_file() {
        let dir = std::env::temp_dir().join(format!("furly-conf-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("client.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
[log]
to = "off"
level = "debug"

[mqtt]
host_name = "broker.local"
client_id = "edge-1"
number_of_client_partitions = 4
max_pending_messages = 16
overflow_strategy = "drop_oldest_queued_message"
connection_attempt_timeout = "3s"
method_call_timeout_retries = 2

[mqtt.connection_retry]
kind = "fixed"
interval = "100ms"
max_attempts = 5
"#
        )
        .unwrap();

        let settings = Settings::new(path.to_str()).unwrap();
        assert!(settings.log.to.off());
        assert_eq!(settings.mqtt.host_name, "broker.local");
        assert_eq!(settings.mqtt.client_id, "edge-1");
        assert_eq!(settings.mqtt.number_of_client_partitions, 4);
        assert_eq!(settings.mqtt.max_pending_messages, 16);
        assert_eq!(settings.mqtt.overflow_strategy, OverflowStrategy::DropOldestQueuedMessage);
        assert_eq!(settings.mqtt.connection_attempt_timeout, Duration::from_secs(3));
        assert_eq!(settings.mqtt.method_call_timeout_retries, 2);
        assert_eq!(settings.mqtt.connection_retry.max_attempts(), 5);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_from_options() {
        let settings = Settings::from_options(MqttOptions::default());
        assert!(!settings.mqtt.client_id.is_empty());
        assert_eq!(settings.mqtt.number_of_client_partitions, 1);
    }
}
