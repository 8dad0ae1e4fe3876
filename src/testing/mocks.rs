//! Mock implementations for testing
//!
//! Provides a recording data-message listener and a broker-free pub/sub
//! transport so adapters can be exercised without a gateway or broker.

use crate::common::{
    DataMessageListener, ResourceName, SystemPerformanceDataListener, TelemetryDataListener,
};
use crate::data::{ActuatorData, SensorData, SystemPerformanceData};
use crate::mqtt::{ConnectionState, InboundMessage, MqttError, PubSubTransport};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::QoS;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// One publish seen by [`MockPubSubTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// Mock data-message listener recording everything it is handed
#[derive(Default)]
pub struct MockDataMessageListener {
    reject_commands: bool,
    actuator_commands: Mutex<Vec<ActuatorData>>,
    incoming_messages: Mutex<Vec<(ResourceName, String)>>,
    telemetry_listener: Mutex<Option<Arc<dyn TelemetryDataListener>>>,
    sys_perf_listener: Mutex<Option<Arc<dyn SystemPerformanceDataListener>>>,
}

impl MockDataMessageListener {
    /// Listener that acknowledges every command with status 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Listener that records commands but returns no response
    pub fn rejecting() -> Self {
        Self {
            reject_commands: true,
            ..Default::default()
        }
    }

    pub fn actuator_commands(&self) -> Vec<ActuatorData> {
        self.actuator_commands.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn incoming_messages(&self) -> Vec<(ResourceName, String)> {
        self.incoming_messages.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn has_telemetry_listener(&self) -> bool {
        self.telemetry_listener.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn has_system_performance_listener(&self) -> bool {
        self.sys_perf_listener.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Push a telemetry record to whichever listener registered last
    pub fn push_sensor_data(&self, data: &SensorData) -> bool {
        let listener = self.telemetry_listener.lock().unwrap_or_else(PoisonError::into_inner).clone();
        listener.is_some_and(|l| l.on_sensor_data_update(data))
    }

    pub fn push_system_performance_data(&self, data: &SystemPerformanceData) -> bool {
        let listener = self.sys_perf_listener.lock().unwrap_or_else(PoisonError::into_inner).clone();
        listener.is_some_and(|l| l.on_system_performance_data_update(data))
    }
}

impl DataMessageListener for MockDataMessageListener {
    fn handle_actuator_command_message(&self, data: &ActuatorData) -> Option<ActuatorData> {
        self.actuator_commands.lock().unwrap_or_else(PoisonError::into_inner).push(data.clone());
        if self.reject_commands {
            return None;
        }

        let mut response = data.clone();
        response.set_as_response();
        response.set_status_code(0);
        Some(response)
    }

    fn handle_incoming_message(&self, resource: ResourceName, msg: &str) -> bool {
        self.incoming_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((resource, msg.to_string()));
        true
    }

    fn set_telemetry_data_listener(&self, listener: Arc<dyn TelemetryDataListener>) {
        *self.telemetry_listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    fn set_system_performance_data_listener(&self, listener: Arc<dyn SystemPerformanceDataListener>) {
        *self.sys_perf_listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }
}

/// Mock pub/sub transport for testing
#[derive(Debug, Default)]
pub struct MockPubSubTransport {
    pub should_fail: bool,
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<InboundMessage>>>,
}

impl MockPubSubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Deliver a message as if the broker had sent it. Returns false when
    /// not connected.
    pub fn inject(&self, topic: &str, payload: &[u8]) -> bool {
        match self.inbound.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(tx) => tx
                .send(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                })
                .is_ok(),
            None => false,
        }
    }

    fn check_connected(&self) -> Result<(), MqttError> {
        if self.should_fail || !self.is_connected() {
            return Err(MqttError::NotConnected {
                state: ConnectionState::Disconnected("Mock disconnection".to_string()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PubSubTransport for MockPubSubTransport {
    async fn connect(&mut self, inbound: mpsc::UnboundedSender<InboundMessage>) -> Result<(), MqttError> {
        if self.should_fail {
            return Err(MqttError::ConnectionFailedStr("Mock connection failure".to_string()));
        }
        *self.inbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(inbound);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), MqttError> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), MqttError> {
        self.check_connected()?;
        self.published.lock().unwrap_or_else(PoisonError::into_inner).push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        self.check_connected()?;
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        subscriptions.retain(|(t, _)| t != topic);
        subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.check_connected()?;
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner).retain(|(t, _)| t != topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_records_publishes() {
        let mut transport = MockPubSubTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(transport.publish("t", vec![1], QoS::AtMostOnce).await.is_err());
        transport.connect(tx).await.unwrap();
        transport.publish("t", vec![1], QoS::AtLeastOnce).await.unwrap();

        assert_eq!(transport.published()[0].qos, QoS::AtLeastOnce);
        assert!(transport.inject("a/b", b"hi"));
        assert_eq!(rx.recv().await.unwrap().topic, "a/b");

        transport.disconnect().await.unwrap();
        assert!(!transport.inject("a/b", b"hi"));
    }

    #[tokio::test]
    async fn test_mock_transport_failure() {
        let mut transport = MockPubSubTransport::with_failure();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(transport.connect(tx).await.is_err());
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_mock_listener_modes() {
        let command = ActuatorData::new("hvac", 2, 1, 20.0);

        let accepting = MockDataMessageListener::new();
        let response = accepting.handle_actuator_command_message(&command).unwrap();
        assert!(response.is_response);

        let rejecting = MockDataMessageListener::rejecting();
        assert!(rejecting.handle_actuator_command_message(&command).is_none());
        assert_eq!(rejecting.actuator_commands().len(), 1);
    }
}
