//! Pub/sub transport seam and its rumqttc implementation
//!
//! The connector talks to brokers only through [`PubSubTransport`], so tests
//! can swap in a recording mock. [`RumqttcTransport`] owns the network loop
//! task, reconnects with backoff and resolves publishes once the broker has
//! acknowledged them.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttGatewaySection;
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop, MqttOptions};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the request channel between the client handle and its loop
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Message delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Broker connection used by the pub/sub client
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Open the connection; inbound messages are sent to `inbound` until
    /// disconnect. Resolves once the broker has accepted the connection.
    async fn connect(&mut self, inbound: mpsc::UnboundedSender<InboundMessage>) -> Result<(), MqttError>;

    async fn disconnect(&mut self) -> Result<(), MqttError>;

    fn is_connected(&self) -> bool;

    /// Publish and wait for the delivery acknowledgement matching `qos`
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), MqttError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError>;
}

#[derive(Default)]
struct TrackerState {
    /// Publishes handed to the loop but not yet written, in request order
    queued: VecDeque<(QoS, oneshot::Sender<()>)>,
    /// Written QoS 1/2 publishes waiting for PUBACK/PUBCOMP
    in_flight: HashMap<u16, oneshot::Sender<()>>,
}

/// Matches broker acknowledgements to waiting publishers.
///
/// The network loop writes publishes in request order, so the n-th
/// outgoing publish event belongs to the n-th tracked request.
#[derive(Default)]
pub struct PublishTracker {
    state: StdMutex<TrackerState>,
}

impl PublishTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a publish about to be requested
    pub fn track(&self, qos: QoS) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.lock().queued.push_back((qos, tx));
        rx
    }

    /// Undo the most recent `track` when the request never reached the loop
    pub fn discard_newest(&self) {
        self.lock().queued.pop_back();
    }

    /// The loop wrote a publish with `pkid`. QoS 0 completes here.
    pub fn on_sent(&self, pkid: u16) {
        let mut state = self.lock();
        let Some((qos, tx)) = state.queued.pop_front() else {
            debug!(pkid = pkid, "Untracked outgoing publish");
            return;
        };
        match qos {
            QoS::AtMostOnce => {
                let _ = tx.send(());
            }
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                state.in_flight.insert(pkid, tx);
            }
        }
    }

    /// PUBACK or PUBCOMP arrived for `pkid`
    pub fn on_acknowledged(&self, pkid: u16) -> bool {
        match self.lock().in_flight.remove(&pkid) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Fail every waiting publisher, e.g. on connection loss
    pub fn fail_all(&self) -> usize {
        let mut state = self.lock();
        let failed = state.queued.len() + state.in_flight.len();
        state.queued.clear();
        state.in_flight.clear();
        failed
    }

    pub fn pending(&self) -> usize {
        let state = self.lock();
        state.queued.len() + state.in_flight.len()
    }
}

/// Transport backed by a rumqttc v5 client and its event loop
pub struct RumqttcTransport {
    options: MqttOptions,
    ack_timeout: Duration,
    reconnect_config: ReconnectConfig,
    client: Option<Arc<Mutex<AsyncClient>>>,
    tracker: Arc<PublishTracker>,
    subscriptions: Arc<StdMutex<Vec<(String, QoS)>>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    event_loop_handle: Option<JoinHandle<()>>,
}

impl RumqttcTransport {
    pub fn new(client_id: &str, broker: SocketAddr, config: &MqttGatewaySection) -> Self {
        Self {
            options: configure_mqtt_options(client_id, broker, config),
            ack_timeout: config.ack_timeout(),
            reconnect_config: ReconnectConfig::default(),
            client: None,
            tracker: Arc::new(PublishTracker::new()),
            subscriptions: Arc::new(StdMutex::new(Vec::new())),
            state_rx: None,
            shutdown_tx: None,
            event_loop_handle: None,
        }
    }

    pub fn with_reconnect_config(mut self, reconnect_config: ReconnectConfig) -> Self {
        self.reconnect_config = reconnect_config;
        self
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    fn check_connection_state(&self) -> Result<Arc<Mutex<AsyncClient>>, MqttError> {
        let state = self
            .connection_state()
            .unwrap_or_else(|| ConnectionState::Disconnected("never connected".to_string()));
        match (&self.client, state.can_publish()) {
            (Some(client), true) => Ok(client.clone()),
            _ => Err(MqttError::NotConnected { state }),
        }
    }

    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let confirmation = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr("State channel closed".to_string()));
                }
                let state = state_rx.borrow().clone();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match confirmation {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    async fn stop_event_loop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!("MQTT event loop shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("MQTT event loop ended with error: {}", e),
                Err(_) => warn!("MQTT event loop didn't shut down gracefully, abandoning it"),
                _ => {}
            }
        }
        self.tracker.fail_all();
    }
}

#[async_trait]
impl PubSubTransport for RumqttcTransport {
    async fn connect(&mut self, inbound: mpsc::UnboundedSender<InboundMessage>) -> Result<(), MqttError> {
        let (client, event_loop) = AsyncClient::new(self.options.clone(), REQUEST_CHANNEL_CAPACITY);
        let client = Arc::new(Mutex::new(client));

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let network_loop = NetworkLoop {
            event_loop,
            client: client.clone(),
            tracker: self.tracker.clone(),
            subscriptions: self.subscriptions.clone(),
            inbound,
            state_tx,
            shutdown_rx,
            reconnect_config: self.reconnect_config.clone(),
        };
        self.event_loop_handle = Some(tokio::spawn(network_loop.run()));
        self.client = Some(client);
        self.state_rx = Some(state_rx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        let (host, port) = self.options.broker_address();
        match Self::wait_for_connection_confirmation(state_rx, self.ack_timeout).await {
            Ok(()) => {
                info!(host = %host, port = port, "Connected to MQTT broker");
                Ok(())
            }
            Err(e) => {
                self.stop_event_loop().await;
                self.client = None;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), MqttError> {
        let result = match &self.client {
            Some(client) => client
                .lock()
                .await
                .disconnect()
                .await
                .map_err(|e| MqttError::ConnectionFailed(Box::new(e))),
            None => Ok(()),
        };

        self.stop_event_loop().await;
        self.client = None;
        self.state_rx = None;
        info!("MQTT transport disconnected");
        result
    }

    fn is_connected(&self) -> bool {
        self.connection_state()
            .is_some_and(|state| state.can_publish())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), MqttError> {
        let client = self.check_connection_state()?;

        let acknowledged = {
            // Held across request and tracking so tracker order matches loop order
            let client = client.lock().await;
            let acknowledged = self.tracker.track(qos);
            if let Err(e) = client.publish(topic, qos, false, payload).await {
                self.tracker.discard_newest();
                return Err(MqttError::PublishFailed(Box::new(e)));
            }
            acknowledged
        };

        match tokio::time::timeout(self.ack_timeout, acknowledged).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MqttError::ConnectionFailedStr(format!(
                "Connection lost before publish on {topic} was acknowledged"
            ))),
            Err(_) => Err(MqttError::AckTimeout {
                topic: topic.to_string(),
                timeout: self.ack_timeout,
            }),
        }
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        let client = self.check_connection_state()?;
        client
            .lock()
            .await
            .subscribe(topic, qos)
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;

        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        subscriptions.retain(|(t, _)| t != topic);
        subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        let client = self.check_connection_state()?;
        client
            .lock()
            .await
            .unsubscribe(topic)
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;

        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(t, _)| t != topic);
        Ok(())
    }
}

/// State owned by the network loop task
struct NetworkLoop {
    event_loop: EventLoop,
    client: Arc<Mutex<AsyncClient>>,
    tracker: Arc<PublishTracker>,
    subscriptions: Arc<StdMutex<Vec<(String, QoS)>>>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_config: ReconnectConfig,
}

impl NetworkLoop {
    async fn run(mut self) {
        debug!("Starting MQTT network loop");
        let mut reconnect_attempts = 0u32;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        debug!("Shutdown signal received, stopping MQTT network loop");
                        break;
                    }
                }
                event = self.event_loop.poll() => match event {
                    Ok(event) => {
                        let route = MessageHandler::route_mqtt_event(&event);
                        if route == EventRoute::ConnectionAcknowledged {
                            reconnect_attempts = 0;
                        }
                        self.process_event_route(route).await;
                    }
                    Err(e) => {
                        let failed = self.tracker.fail_all();
                        error!(error = %e, failed_publishes = failed, "MQTT network loop error");
                        let _ = self.state_tx.send(ConnectionState::Disconnected(e.to_string()));

                        reconnect_attempts = reconnect_attempts.saturating_add(1);
                        let delay_ms = self.reconnect_config.calculate_backoff_delay(reconnect_attempts);
                        let _ = self.state_tx.send(ConnectionState::Reconnecting(reconnect_attempts));
                        info!("Attempting reconnection {} after {}ms delay", reconnect_attempts, delay_ms);

                        if !self.interruptible_sleep(delay_ms).await {
                            break;
                        }
                    }
                },
            }
        }

        debug!("MQTT network loop stopped");
    }

    async fn process_event_route(&mut self, route: EventRoute) {
        match route {
            EventRoute::ConnectionAcknowledged => {
                let _ = self.state_tx.send(ConnectionState::Connected);
                self.resubscribe_to_topics();
            }
            EventRoute::MessageReceived { topic, payload, retain } => {
                debug!(topic = %topic, retain = retain, len = payload.len(), "Received MQTT message");
                if self.inbound.send(InboundMessage { topic, payload }).is_err() {
                    debug!("Inbound channel closed, message dropped");
                }
            }
            EventRoute::Disconnected => {
                let failed = self.tracker.fail_all();
                warn!(failed_publishes = failed, "MQTT broker disconnected client");
                let _ = self
                    .state_tx
                    .send(ConnectionState::Disconnected("Broker disconnected".to_string()));
            }
            EventRoute::PublishSent(pkid) => self.tracker.on_sent(pkid),
            EventRoute::PublishAcknowledged(pkid) => {
                if !self.tracker.on_acknowledged(pkid) {
                    debug!(pkid = pkid, "Acknowledgement with no waiting publisher");
                }
            }
            EventRoute::SubscriptionConfirmed { packet_id, reason_codes } => {
                debug!(target: "mqtt_transport", packet_id = packet_id, "Subscription confirmed: {}", reason_codes);
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
            }
            EventRoute::OutgoingEvent => {}
        }
    }

    /// Restore subscriptions after a (re)connect. Non-blocking: the request
    /// channel is drained by this very loop.
    fn resubscribe_to_topics(&self) {
        let topics = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if topics.is_empty() {
            return;
        }

        let Ok(client) = self.client.try_lock() else {
            warn!("Client busy, subscriptions not restored on this connect");
            return;
        };
        for (topic, qos) in topics {
            match client.try_subscribe(topic.clone(), qos) {
                Ok(()) => debug!(target: "mqtt_transport", "Re-subscribed to: {}", topic),
                Err(e) => error!("Failed to re-subscribe to {}: {}", topic, e),
            }
        }
    }

    /// Returns false if shutdown was requested during the delay
    async fn interruptible_sleep(&mut self, delay_ms: u64) -> bool {
        tokio::select! {
            _ = self.shutdown_rx.changed() => !*self.shutdown_rx.borrow(),
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_qos0_completes_when_written() {
        let tracker = PublishTracker::new();
        let ack = tracker.track(QoS::AtMostOnce);
        tracker.on_sent(0);
        assert!(ack.await.is_ok());
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_qos1_waits_for_puback() {
        let tracker = PublishTracker::new();
        let mut ack = tracker.track(QoS::AtLeastOnce);

        tracker.on_sent(42);
        assert!(ack.try_recv().is_err());
        assert_eq!(tracker.pending(), 1);

        assert!(tracker.on_acknowledged(42));
        assert!(ack.await.is_ok());
        assert!(!tracker.on_acknowledged(42));
    }

    #[tokio::test]
    async fn test_publishes_matched_in_request_order() {
        let tracker = PublishTracker::new();
        let first = tracker.track(QoS::AtLeastOnce);
        let second = tracker.track(QoS::ExactlyOnce);

        tracker.on_sent(1);
        tracker.on_sent(2);
        tracker.on_acknowledged(2);
        tracker.on_acknowledged(1);

        assert!(first.await.is_ok());
        assert!(second.await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_all_drops_waiters() {
        let tracker = PublishTracker::new();
        let queued = tracker.track(QoS::AtLeastOnce);
        let in_flight = tracker.track(QoS::AtLeastOnce);
        tracker.on_sent(5);

        assert_eq!(tracker.fail_all(), 2);
        assert!(queued.await.is_err());
        assert!(in_flight.await.is_err());
    }

    #[test]
    fn test_discard_newest() {
        let tracker = PublishTracker::new();
        let _first = tracker.track(QoS::AtMostOnce);
        let _second = tracker.track(QoS::AtLeastOnce);
        tracker.discard_newest();
        assert_eq!(tracker.pending(), 1);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let config = MqttGatewaySection::default();
        let transport = RumqttcTransport::new("cda-test", "127.0.0.1:1883".parse().unwrap(), &config);

        assert!(!transport.is_connected());
        assert!(matches!(
            transport.publish("t", b"x".to_vec(), QoS::AtMostOnce).await,
            Err(MqttError::NotConnected { .. })
        ));
        assert!(transport.subscribe("t", QoS::AtMostOnce).await.is_err());
    }
}
