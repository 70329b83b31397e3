//! MQTT agent gateway
//!
//! Session layer between an MQTT broker and in-process message consumers.
//!
//! # Overview
//!
//! - Topic filter matching with `+` and `#` wildcards
//! - A subscription registry keeping exactly one broker subscription per
//!   filter, however many consumers share it
//! - Concurrent, isolated fan-out of inbound messages to consumers
//! - A retained outbox the transport pulls from when it is ready to send
//! - Liveness announcement on a status topic, with a last will so the broker
//!   reports abnormal loss
//!
//! # Quick Start
//!
//! ```rust
//! use agent_gateway::agent::{AgentIdentity, AgentSession, ConsumerHandle, WorkerPool};
//! use agent_gateway::testing::{MockTransport, RecordingConsumer};
//! use std::sync::Arc;
//!
//! # let outcome = tokio_test::block_on(async {
//! let transport = Arc::new(MockTransport::new());
//! let session = AgentSession::new(
//!     AgentIdentity::new("lamp-1", "lamp-1-session"),
//!     transport.clone(),
//!     WorkerPool::current("consumers"),
//! );
//!
//! let consumer = ConsumerHandle::new(RecordingConsumer::new("ui"));
//! session.subscribe("sensors/+/temp", consumer).await?;
//! session.connect().await?;
//! session.add_message("state", Some(&"on")).await?;
//! session.disconnect().await?;
//! # Ok::<(), agent_gateway::AgentError>(())
//! # });
//! # outcome.unwrap();
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use agent::{AgentIdentity, AgentSession, ConsumerHandle, MessageConsumer};
pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};
pub use transport::mqtt::MqttClient;
pub use transport::Transport;
