//! Constrained Device Agent - connection layer
//!
//! Connects a constrained device to a remote gateway over two protocols:
//! CoAP for request/response access and observation of device resources,
//! and MQTT for topic-based publish/subscribe.
//!
//! # Overview
//!
//! - [`coap::client`] - request/response client with blocking and
//!   background-event-loop runtimes behind one [`coap::RequestResponseClient`]
//!   trait, including resource observation
//! - [`coap::server`] - server adapter hosting a fail-closed resource tree
//!   with telemetry, system-performance and actuator handlers
//! - [`mqtt`] - publish/subscribe client connector over rumqttc
//! - [`common`] - resource names, path resolution and the
//!   [`common::DataMessageListener`] bridge to domain logic
//! - [`data`] - record types and their JSON codec
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cda_agent::coap::CoapServerAdapter;
//! use cda_agent::common::DefaultDataMessageListener;
//! use cda_agent::config::CdaConfig;
//! use cda_agent::data::SensorData;
//! use std::sync::Arc;
//!
//! let config = CdaConfig::default();
//! let listener = Arc::new(DefaultDataMessageListener::new());
//! let server = CoapServerAdapter::new(&config, Some(listener.clone()))?;
//! server.start_server();
//!
//! // Domain logic pushes fresh telemetry; observers are notified
//! listener.handle_sensor_message(&SensorData::new("TempSensor", 1, 21.5));
//!
//! server.stop_server();
//! # Ok::<(), cda_agent::error::CdaError>(())
//! ```

pub mod coap;
pub mod common;
pub mod config;
pub mod data;
pub mod error;
pub mod mqtt;
pub mod observability;
pub mod runtime;
pub mod testing;

pub use coap::{create_client, CoapServerAdapter, RequestResponseClient};
pub use common::{DataMessageListener, DefaultDataMessageListener, ResourceName};
pub use config::CdaConfig;
pub use error::{CdaError, CdaResult};
pub use mqtt::MqttClientConnector;
