//! Connection state, reconnection policy and option building for the
//! pub/sub client
//!
//! Everything here is pure: no sockets, no tasks.

use crate::config::MqttGatewaySection;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Largest packet accepted from the broker
pub const MAX_PACKET_SIZE: u32 = 64 * 1024;

/// Connection state of the pub/sub transport
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - waiting for ConnAck
    Connecting,
    /// ConnAck received, ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Waiting before the given reconnection attempt
    Reconnecting(u32),
}

impl ConnectionState {
    pub fn can_publish(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Reconnection backoff policy
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay used once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnection `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Pub/sub transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("No acknowledgement for publish on {topic} within {timeout:?}")]
    AckTimeout { topic: String, timeout: Duration },
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Build client options for the broker at `broker`.
///
/// Credentials come from the environment variables named in the config;
/// a username without a password variable gets an empty password.
pub fn configure_mqtt_options(client_id: &str, broker: SocketAddr, config: &MqttGatewaySection) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, broker.ip().to_string(), broker.port());

    if let Some(username) = config.username() {
        let password = config.password().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(config.keep_alive());
    mqtt_options.set_clean_start(true);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    mqtt_options
}

/// Map an ordinal quality tier to a QoS level.
///
/// Values outside 0..=2 fall back to `default`, and an invalid default falls
/// back to at-most-once.
pub fn resolve_qos(qos: u8, default: u8) -> QoS {
    qos_from_level(qos)
        .or_else(|| qos_from_level(default))
        .unwrap_or(QoS::AtMostOnce)
}

pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}
