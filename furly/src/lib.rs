#![deny(unsafe_code)]

//! Managed MQTT client sessions.
//!
//! Keeps a logical session alive across reconnects, queues operations while
//! disconnected within bounded per kind queues, spreads topics over several
//! physical connections and layers request/response calls on publish/subscribe.
//!
//! # Example
//! ```rust,no_run
//! use furly::conf::MqttOptions;
//! use furly::{Message, MqttClient, MqttError, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (client, _broker) = MqttClient::in_memory(MqttOptions::default());
//!     client.ready().await?;
//!
//!     let _subscription = client
//!         .subscribe("test/+", |msg: Message| async move {
//!             println!("{} {:?}", msg.topic, msg.payload);
//!             Ok::<_, MqttError>(())
//!         })
//!         .await?;
//!
//!     client.publish(Message::new("test/alpha", vec![1u8, 2, 3])).await?;
//!     client.close().await
//! }
//! ```

pub mod client; // Partitioned session client
pub mod connection; // Connection lifecycle of one partition
pub mod error;
pub mod event; // Event builder and subscriber interfaces
pub mod logger;
pub mod memory; // In-process broker
pub mod queue; // Bounded outbound queues
pub mod retry;
pub mod router; // Event dispatch
pub mod rpc; // Request/response correlation
pub mod topic; // Topic filter matching and escaping
pub mod types;
pub mod wire; // Seam to the protocol implementation

pub use furly_conf as conf;
pub use furly_utils as utils;

pub use client::{partition_for, MqttClient, SubscriptionHandle};
pub use error::{MqttError, Result};
pub use event::{EventBuilder, EventClient, EventSubscriber};
pub use memory::MemoryBroker;
pub use router::{EventConsumer, EventConsumerRef};
pub use rpc::{MethodCall, MethodHandler, MethodHandlerRef, RpcClient, RpcServer, ServerRegistration};
pub use types::{ClientEvent, ConnectionState, Message, MessageProperties, OverflowStrategy, QoS};
