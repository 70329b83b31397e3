//! MQTT v5 transport built on rumqttc
//!
//! - [`connection`] - pure option assembly and broker URL parsing
//! - [`message_handler`] - pure event routing
//! - [`client`] - the I/O side: event loop pump and outbox publisher
//!
//! ```rust,no_run
//! use agent_gateway::agent::{AgentIdentity, AgentSession, WorkerPool};
//! use agent_gateway::config::MqttSection;
//! use agent_gateway::transport::mqtt::MqttClient;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let transport = MqttClient::new(MqttSection::for_broker("mqtt://localhost:1883"))?;
//! let session = AgentSession::new(
//!     AgentIdentity::new("lamp-1", "lamp-1-session"),
//!     Arc::new(transport),
//!     WorkerPool::current("consumers"),
//! );
//! session.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{configure_mqtt_options, parse_broker_url, BrokerEndpoint, ConnectionState};
pub use message_handler::{EventRoute, MessageHandler};
