//! Publish/subscribe client connector
//!
//! Thin guard layer over a [`PubSubTransport`]: it validates arguments,
//! clamps quality tiers, and runs the dispatcher task that hands inbound
//! messages to the bound data-message listener.

use super::connection::{qos_level, resolve_qos};
use super::message_handler::MessageHandler;
use super::transport::{InboundMessage, PubSubTransport, RumqttcTransport};
use crate::common::{resolve_host, DataMessageListener, ListenerSlot, ResourceName};
use crate::config::MqttGatewaySection;
use crate::error::CdaResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Prefix of generated client ids
pub const CLIENT_ID_PREFIX: &str = "cda";

/// Pub/sub client for the device's resource topics
pub struct MqttClientConnector<T = RumqttcTransport> {
    client_id: String,
    default_qos: u8,
    transport: T,
    listener: Arc<ListenerSlot>,
    dispatcher: Option<JoinHandle<()>>,
    connected: bool,
}

impl MqttClientConnector<RumqttcTransport> {
    /// Build a connector for the configured broker.
    ///
    /// The broker host is resolved here; an unresolvable host is a startup
    /// error rather than a connect-time failure.
    pub fn new(config: &MqttGatewaySection) -> CdaResult<Self> {
        let broker = resolve_host(&config.host, config.port)?;
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("{CLIENT_ID_PREFIX}-{}", uuid::Uuid::new_v4().simple()));

        info!(client_id = %client_id, broker = %broker, "MQTT client connector created");
        let transport = RumqttcTransport::new(&client_id, broker, config);
        Ok(Self::with_transport(client_id, config.default_qos, transport))
    }
}

impl<T: PubSubTransport> MqttClientConnector<T> {
    pub fn with_transport(client_id: String, default_qos: u8, transport: T) -> Self {
        Self {
            client_id,
            default_qos,
            transport,
            listener: Arc::new(ListenerSlot::new(None)),
            dispatcher: None,
            connected: false,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// True between a successful connect and the next disconnect
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Connect to the broker and start dispatching inbound messages.
    ///
    /// Returns false (and does nothing) when already connected, or when the
    /// connection attempt fails.
    pub async fn connect_client(&mut self) -> bool {
        if self.connected {
            warn!(client_id = %self.client_id, "MQTT client already connected, ignoring connect request");
            return false;
        }

        let span = crate::mqtt_span!(operation = "connect", client_id = %self.client_id);

        // Dispatcher is in place before the first message can arrive
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(
            run_dispatcher(inbound_rx, self.listener.clone()).instrument(span.clone()),
        );

        match self.transport.connect(inbound_tx).instrument(span).await {
            Ok(()) => {
                self.dispatcher = Some(dispatcher);
                self.connected = true;
                info!(client_id = %self.client_id, "MQTT client connected");
                true
            }
            Err(e) => {
                dispatcher.abort();
                warn!(client_id = %self.client_id, error = %e, "MQTT connection failed");
                false
            }
        }
    }

    /// Disconnect from the broker. Returns false when not connected.
    pub async fn disconnect_client(&mut self) -> bool {
        if !self.connected {
            warn!(client_id = %self.client_id, "MQTT client not connected, ignoring disconnect request");
            return false;
        }

        if let Err(e) = self.transport.disconnect().await {
            warn!(client_id = %self.client_id, error = %e, "Error while disconnecting from broker");
        }
        self.connected = false;

        if let Some(dispatcher) = self.dispatcher.take() {
            // Ends once the transport drops its inbound sender
            if tokio::time::timeout(Duration::from_secs(2), dispatcher).await.is_err() {
                warn!("Inbound dispatcher didn't stop in time");
            }
        }

        info!(client_id = %self.client_id, "MQTT client disconnected");
        true
    }

    /// Publish `msg` on the topic of `resource` and wait for the broker's
    /// acknowledgement.
    pub async fn publish_message(&self, resource: Option<ResourceName>, msg: Option<&str>, qos: u8) -> bool {
        let Some(resource) = resource else {
            warn!("No topic specified, message not published");
            return false;
        };
        let Some(msg) = msg else {
            warn!(topic = %resource, "No message payload, nothing published");
            return false;
        };

        let qos = resolve_qos(qos, self.default_qos);
        let topic = MessageHandler::topic_for(resource);
        let span = crate::mqtt_span!(operation = "publish", topic = %topic, qos = qos_level(qos));

        match self
            .transport
            .publish(topic, msg.as_bytes().to_vec(), qos)
            .instrument(span)
            .await
        {
            Ok(()) => {
                debug!(topic = %topic, len = msg.len(), "Published message");
                true
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to publish message");
                false
            }
        }
    }

    pub async fn subscribe_to_topic(&self, resource: Option<ResourceName>, qos: u8) -> bool {
        let Some(resource) = resource else {
            warn!("No topic specified, subscription not created");
            return false;
        };

        let qos = resolve_qos(qos, self.default_qos);
        let topic = MessageHandler::topic_for(resource);

        match self.transport.subscribe(topic, qos).await {
            Ok(()) => {
                info!(topic = %topic, qos = qos_level(qos), "Subscribed to topic");
                true
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to subscribe to topic");
                false
            }
        }
    }

    pub async fn unsubscribe_from_topic(&self, resource: Option<ResourceName>) -> bool {
        let Some(resource) = resource else {
            warn!("No topic specified, nothing to unsubscribe");
            return false;
        };

        let topic = MessageHandler::topic_for(resource);
        match self.transport.unsubscribe(topic).await {
            Ok(()) => {
                info!(topic = %topic, "Unsubscribed from topic");
                true
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to unsubscribe from topic");
                false
            }
        }
    }

    /// Bind the listener that receives inbound messages. Replaces any
    /// previous listener; takes effect for the next message.
    pub fn set_data_message_listener(&self, listener: Arc<dyn DataMessageListener>) -> bool {
        if self.listener.set(listener).is_some() {
            debug!("Replaced data message listener");
        }
        true
    }
}

async fn run_dispatcher(mut inbound: mpsc::UnboundedReceiver<InboundMessage>, listener: Arc<ListenerSlot>) {
    while let Some(message) = inbound.recv().await {
        let current = listener.get();
        let outcome = MessageHandler::dispatch_inbound(current.as_deref(), &message.topic, &message.payload);
        debug!(topic = %message.topic, outcome = ?outcome, "Inbound message dispatched");
    }
    debug!("Inbound dispatcher stopped");
}
