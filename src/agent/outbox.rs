//! Retained-state outbox
//!
//! Holds the latest message per fully-qualified publish topic. The transport
//! reads from here when it is ready to send; entries are only ever
//! overwritten, never removed.

use crate::protocol::publish_topic;
use crate::transport::{OutboxMessage, CORE_QOS};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Latest retained message per publish topic
#[derive(Debug)]
pub struct Outbox {
    agent_id: String,
    messages: Mutex<HashMap<String, OutboxMessage>>,
}

impl Outbox {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            messages: Mutex::new(HashMap::new()),
        }
    }

    /// Fully-qualified topic for a logical topic
    pub fn topic_for(&self, logical_topic: &str) -> String {
        publish_topic(logical_topic, &self.agent_id)
    }

    /// Store an already encoded payload; `None` stores an empty message.
    /// Returns the stored message.
    pub fn put(&self, logical_topic: &str, payload: Option<Bytes>) -> OutboxMessage {
        let message = OutboxMessage {
            topic: self.topic_for(logical_topic),
            payload: payload.unwrap_or_default(),
            qos: CORE_QOS,
            retain: true,
        };

        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message.topic.clone(), message.clone());

        message
    }

    /// Latest message stored for a fully-qualified topic
    pub fn get(&self, topic: &str) -> Option<OutboxMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
    }

    pub fn topics(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
