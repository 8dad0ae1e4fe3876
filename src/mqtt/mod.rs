//! Publish/subscribe client for the device's resource topics
//!
//! # Architecture
//!
//! - [`connection`] - connection state, reconnection policy, option building
//! - [`message_handler`] - event routing and inbound dispatch
//! - [`transport`] - the [`PubSubTransport`] seam and its rumqttc backend
//! - [`client`] - the guarded connector used by applications
//!
//! # Usage
//!
//! ```rust,no_run
//! use cda_agent::common::ResourceName;
//! use cda_agent::config::MqttGatewaySection;
//! use cda_agent::mqtt::MqttClientConnector;
//!
//! # tokio_test::block_on(async {
//! let mut client = MqttClientConnector::new(&MqttGatewaySection::default())?;
//! if client.connect_client().await {
//!     client.subscribe_to_topic(Some(ResourceName::CdaActuatorCmd), 1).await;
//!     client.publish_message(Some(ResourceName::CdaSensorMsg), Some("{}"), 1).await;
//!     client.disconnect_client().await;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;
pub mod transport;

pub use client::MqttClientConnector;
pub use connection::{resolve_qos, ConnectionState, MqttError, ReconnectConfig};
pub use message_handler::{DispatchOutcome, EventRoute, MessageHandler};
pub use transport::{InboundMessage, PubSubTransport, PublishTracker, RumqttcTransport};
