//! Pure routing of rumqttc events
//!
//! The event loop task maps every polled event to an [`EventRoute`] and acts
//! on the route; nothing here performs I/O.

use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::Event;

/// Stateless event classifier
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT v5 event
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => {
                    if matches!(connack.code, ConnectReturnCode::Success) {
                        EventRoute::ConnectionAcknowledged
                    } else {
                        EventRoute::ConnectionRefused(format!("{:?}", connack.code))
                    }
                }
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                },
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged {
                    packet_id: puback.pkid,
                },
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
                }
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    filters: suback.return_codes.len(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the connection
    ConnectionAcknowledged,
    /// Broker rejected the connection with a reason code
    ConnectionRefused(String),
    /// Message on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// QoS 1 publish acknowledged
    PublishAcknowledged { packet_id: u16 },
    /// Broker sent DISCONNECT
    Disconnected(String),
    SubscriptionConfirmed { packet_id: u16, filters: usize },
    /// PingResp and the like
    InfrastructureEvent(String),
    OutgoingEvent,
}
