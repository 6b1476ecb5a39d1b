//! MQTT 3.1 / 3.1.1 broker and client transport core.
//!
//! The crate speaks both MQTT 3.1 (`MQIsdp`, level 3) and MQTT 3.1.1
//! (`MQTT`, level 4). Each broker session fixes its version from the first
//! CONNECT it reads; a CONNECT asking for MQTT 5.0 is refused with
//! [`Error::Unsupported`].
//!
//! ## Components
//!
//! - [`protocol`]: zero-copy framing ([`protocol::FrameReader`],
//!   [`protocol::Frame`]), the packet model and the version codec.
//! - [`topic`] and [`trie`]: topic filter matching.
//! - [`Broker`]: runs one session per [`Connection`] and forwards each
//!   PUBLISH frame unchanged to every subscribed session.
//! - [`Client`]: connects over any [`Connection`], with QoS 0 and QoS 1
//!   publish, subscribe and unsubscribe.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use giztoy_mqtt3::{Broker, BrokerConfig, Client, ClientConfig, QoS};
//!
//! #[tokio::main]
//! async fn main() -> giztoy_mqtt3::Result<()> {
//!     // Start broker
//!     let broker = Arc::new(Broker::new(BrokerConfig::new("127.0.0.1:1883")));
//!     let server = Arc::clone(&broker);
//!     tokio::spawn(async move { server.serve().await });
//!
//!     // Connect client
//!     let client = Client::connect_tcp(ClientConfig::new("127.0.0.1:1883", "client-1")).await?;
//!
//!     // Subscribe and publish
//!     client.subscribe(&[("test/topic", QoS::AtMostOnce)]).await?;
//!     client.publish("test/topic", "hello").await?;
//!
//!     // Receive message
//!     let msg = client.recv().await?;
//!     println!("Received: {:?}", msg);
//!
//!     client.disconnect().await?;
//!     broker.shutdown();
//!     Ok(())
//! }
//! ```

mod broker;
mod client;
mod error;
pub mod protocol;
mod registry;
mod session;
pub mod topic;
pub mod transport;
pub mod trie;
mod types;

pub use broker::{Broker, BrokerBuilder, BrokerConfig};
pub use client::{Client, ClientConfig};
pub use error::{Error, Result};
pub use registry::Registry;
pub use session::SessionHandle;
pub use transport::Connection;
pub use types::{ConnectReturnCode, Handler, Message, PacketType, ProtocolVersion, QoS};
