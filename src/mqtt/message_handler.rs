//! Event routing and inbound message dispatch
//!
//! Pure decisions about what an MQTT event means and where an inbound
//! message goes. Decode failures end here as log lines; nothing propagates
//! back into the network loop.

use crate::common::{DataMessageListener, ResourceName};
use crate::data::{codec, ActuatorData};
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;
use rumqttc::Outgoing;
use tracing::{debug, info, warn};

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Vec<u8>, retain: bool },
    /// Broker sent a disconnect
    Disconnected,
    /// A publish left the client with this packet id (0 for QoS 0)
    PublishSent(u16),
    /// Delivery completed: PUBACK for QoS 1, PUBCOMP for QoS 2
    PublishAcknowledged(u16),
    /// Subscription confirmed
    SubscriptionConfirmed { packet_id: u16, reason_codes: String },
    /// Anything else (PingResp, PubRec, ...)
    InfrastructureEvent(String),
    /// Other outgoing packets
    OutgoingEvent,
}

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the listener
    Delivered,
    /// Unknown topic or undecodable payload
    Discarded,
    /// Valid message but no listener bound
    Ignored,
}

/// Pure message routing decisions
pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged(puback.pkid),
                Packet::PubComp(pubcomp) => EventRoute::PublishAcknowledged(pubcomp.pkid),
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    reason_codes: format!("{:?}", suback.return_codes),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::PublishSent(*pkid),
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Topic for a resource: its canonical path
    pub fn topic_for(resource: ResourceName) -> &'static str {
        resource.segment()
    }

    /// Route one inbound message to the listener.
    ///
    /// Actuator commands are decoded and handed to the command entry point;
    /// messages on any other known resource go up as text.
    pub fn dispatch_inbound(
        listener: Option<&dyn DataMessageListener>,
        topic: &str,
        payload: &[u8],
    ) -> DispatchOutcome {
        let Some(resource) = ResourceName::from_path(topic) else {
            warn!(topic = %topic, "Message on unknown topic, discarded");
            return DispatchOutcome::Discarded;
        };

        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Message payload is not UTF-8, discarded");
                return DispatchOutcome::Discarded;
            }
        };

        if resource == ResourceName::CdaActuatorCmd {
            let command: ActuatorData = match codec::from_json(text) {
                Ok(command) => command,
                Err(e) => {
                    warn!(topic = %topic, error = %e, payload = %text, "Failed to decode actuator command, discarded");
                    return DispatchOutcome::Discarded;
                }
            };

            let Some(listener) = listener else {
                debug!(topic = %topic, "No data message listener, actuator command ignored");
                return DispatchOutcome::Ignored;
            };

            info!(topic = %topic, name = %command.base.name, command = command.command, "Actuator command received");
            match listener.handle_actuator_command_message(&command) {
                Some(response) => debug!(status_code = response.base.status_code, "Actuator command handled"),
                None => warn!(name = %command.base.name, "Listener could not apply actuator command"),
            }
            return DispatchOutcome::Delivered;
        }

        let Some(listener) = listener else {
            debug!(topic = %topic, "No data message listener, message ignored");
            return DispatchOutcome::Ignored;
        };

        listener.handle_incoming_message(resource, text);
        DispatchOutcome::Delivered
    }
}
