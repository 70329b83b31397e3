//! Transport layer for the agent session
//!
//! The session talks to the broker only through [`Transport`], and the
//! transport talks back only through [`InboundHandler`]. The handler is
//! handed over inside [`ConnectParams`] so no transport type has to know
//! about the session.

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

pub mod mqtt;

pub use rumqttc::v5::mqttbytes::QoS;

/// Delivery guarantee used for every publish and subscription the core issues
pub const CORE_QOS: QoS = QoS::AtLeastOnce;

/// Transport collaborator consumed by the agent session
///
/// Implementations use interior mutability so one instance can be shared
/// between the session and the tasks it spawns.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection. Resolves only once the broker acknowledged it.
    async fn connect(&self, params: ConnectParams) -> Result<(), TransportError>;

    /// Close the connection
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Issue a transport-level subscription
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError>;

    /// Retract a transport-level subscription
    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Publish a payload directly
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Signal that a message for `topic` is waiting; the transport pulls it
    /// through [`InboundHandler::message_to_publish`] when it is ready to send.
    async fn ready_to_publish(&self, topic: &str) -> Result<(), TransportError>;

    /// Check whether the transport currently holds a confirmed connection
    fn is_connected(&self) -> bool;
}

/// Inbound callbacks implemented by the session, one method per event kind
///
/// Called from the transport's own task, so implementations must return
/// quickly and never block on consumer work.
pub trait InboundHandler: Send + Sync {
    /// Message arrived on a subscribed topic
    fn on_message(&self, topic: &str, payload: Bytes);

    /// Connection dropped without a graceful disconnect
    fn on_connection_lost(&self, cause: &str);

    /// Broker acknowledged a publish
    fn on_delivery_complete(&self, packet_id: u16);

    /// Pull hook for messages announced through [`Transport::ready_to_publish`]
    fn message_to_publish(&self, topic: &str) -> Option<OutboxMessage>;
}

/// A fully described outgoing message
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Last-will announcement registered with the broker at connect time
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Session-supplied connection parameters
#[derive(Clone)]
pub struct ConnectParams {
    /// Client identifier presented to the broker
    pub client_id: String,
    /// Start without broker-side session state
    pub clean_session: bool,
    /// Announcement the broker publishes if the session drops abnormally
    pub last_will: Option<LastWill>,
    /// Receiver of inbound events for this connection
    pub handler: Arc<dyn InboundHandler>,
}

impl std::fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("client_id", &self.client_id)
            .field("clean_session", &self.clean_session)
            .field("last_will", &self.last_will)
            .finish_non_exhaustive()
    }
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection not acknowledged within {0:?}")]
    ConnectTimeout(std::time::Duration),
    #[error("Not connected")]
    NotConnected,
    #[error("Publishing to {topic} failed")]
    PublishFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Subscription to {filter} failed")]
    SubscriptionFailed {
        filter: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Unsubscribing from {filter} failed")]
    UnsubscriptionFailed {
        filter: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Disconnect failed")]
    DisconnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    impl InboundHandler for NullHandler {
        fn on_message(&self, _topic: &str, _payload: Bytes) {}
        fn on_connection_lost(&self, _cause: &str) {}
        fn on_delivery_complete(&self, _packet_id: u16) {}
        fn message_to_publish(&self, _topic: &str) -> Option<OutboxMessage> {
            None
        }
    }

    #[test]
    fn test_connect_params_debug_omits_handler() {
        let params = ConnectParams {
            client_id: "agent-1".to_string(),
            clean_session: true,
            last_will: None,
            handler: Arc::new(NullHandler),
        };

        let rendered = format!("{params:?}");
        assert!(rendered.contains("agent-1"));
        assert!(rendered.contains("clean_session: true"));
        assert!(!rendered.contains("handler"));
    }

    #[test]
    fn test_transport_error_display() {
        let errors = vec![
            TransportError::ConnectionFailed("refused".to_string()),
            TransportError::ConnectTimeout(std::time::Duration::from_secs(3)),
            TransportError::NotConnected,
            TransportError::PublishFailed {
                topic: "a/b".to_string(),
                source: "boom".into(),
            },
            TransportError::SubscriptionFailed {
                filter: "a/+".to_string(),
                source: "boom".into(),
            },
            TransportError::UnsubscriptionFailed {
                filter: "a/+".to_string(),
                source: "boom".into(),
            },
            TransportError::DisconnectFailed("boom".into()),
            TransportError::InvalidBrokerUrl("nope".to_string()),
            TransportError::ConnectionLost("reset".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
