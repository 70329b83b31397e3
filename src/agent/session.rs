//! Agent session: the single entry point an application uses
//!
//! Owns the subscription registry, the outbox, the dispatcher and the
//! lifecycle, and is the transport's [`InboundHandler`] through a weak
//! back-reference so the transport never keeps the session alive.

use super::consumer::ConsumerHandle;
use super::dispatch::{DispatchStatsSnapshot, Dispatcher, WorkerPool};
use super::lifecycle::{Lifecycle, LifecycleState, SessionEvent};
use super::outbox::Outbox;
use super::registry::{SubscribeOutcome, SubscriptionRegistry, UnsubscribeOutcome};
use crate::config::AgentSection;
use crate::error::{AgentError, AgentResult};
use crate::protocol::{
    decode_with, default_status_topic, encode_with, validate_filter, JsonCodec, PayloadCodec,
};
use crate::transport::{InboundHandler, OutboxMessage, Transport, CORE_QOS};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, trace};

/// Who this session is on the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Suffix appended to every outbox topic
    pub agent_id: String,
    /// Client identifier presented to the broker
    pub session_id: String,
    /// Liveness topic
    pub status_topic: String,
}

impl AgentIdentity {
    /// Identity with the default status topic for `agent_id`
    pub fn new(agent_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            status_topic: default_status_topic(&agent_id),
            agent_id,
            session_id: session_id.into(),
        }
    }

    pub fn with_status_topic(mut self, status_topic: impl Into<String>) -> Self {
        self.status_topic = status_topic.into();
        self
    }

    pub fn from_config(section: &AgentSection) -> Self {
        Self {
            agent_id: section.id.clone(),
            session_id: section.resolved_session_id(),
            status_topic: section.resolved_status_topic(),
        }
    }
}

/// Agent session bound to one transport
pub struct AgentSession {
    pub(super) identity: AgentIdentity,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) codec: Arc<dyn PayloadCodec>,
    registry: RwLock<SubscriptionRegistry>,
    /// Serializes every path that issues transport (un)subscriptions
    pub(super) subscription_gate: tokio::sync::Mutex<()>,
    outbox: Outbox,
    pub(super) dispatcher: Dispatcher,
    pub(super) lifecycle: Lifecycle,
    handle: Weak<AgentSession>,
}

impl AgentSession {
    /// Session using the JSON codec
    pub fn new(identity: AgentIdentity, transport: Arc<dyn Transport>, pool: WorkerPool) -> Arc<Self> {
        Self::with_codec(identity, transport, pool, Arc::new(JsonCodec))
    }

    pub fn with_codec(
        identity: AgentIdentity,
        transport: Arc<dyn Transport>,
        pool: WorkerPool,
        codec: Arc<dyn PayloadCodec>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|handle| Self {
            outbox: Outbox::new(identity.agent_id.clone()),
            identity,
            transport,
            codec,
            registry: RwLock::new(SubscriptionRegistry::new()),
            subscription_gate: tokio::sync::Mutex::new(()),
            dispatcher: Dispatcher::new(pool),
            lifecycle: Lifecycle::new(),
            handle: handle.clone(),
        })
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn agent_id(&self) -> &str {
        &self.identity.agent_id
    }

    pub fn session_id(&self) -> &str {
        &self.identity.session_id
    }

    pub fn status_topic(&self) -> &str {
        &self.identity.status_topic
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.watch()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.lifecycle.events()
    }

    pub fn codec(&self) -> &dyn PayloadCodec {
        self.codec.as_ref()
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.dispatcher.stats()
    }

    pub fn pool(&self) -> &WorkerPool {
        self.dispatcher.pool()
    }

    /// Currently registered filters in no particular order
    pub fn filters(&self) -> Vec<String> {
        self.registry_read().filters()
    }

    pub fn is_subscribed(&self, filter: &str, consumer: &ConsumerHandle) -> bool {
        self.registry_read().is_registered(filter, consumer)
    }

    /// Register `consumer` for messages matching `filter`.
    ///
    /// The first consumer for a filter triggers one transport subscription
    /// while connected, or defers it to the next connect otherwise. On a
    /// transport failure the registry is left unchanged.
    pub async fn subscribe(
        &self,
        filter: &str,
        consumer: ConsumerHandle,
    ) -> AgentResult<SubscribeOutcome> {
        validate_filter(filter).map_err(|reason| AgentError::invalid_filter(filter, reason))?;

        let _gate = self.subscription_gate.lock().await;

        let new_filter = !self.registry_read().contains(filter);
        if new_filter {
            if self.state().is_connected() {
                self.transport.subscribe(filter, CORE_QOS).await?;
                info!(filter = %filter, "Subscribed to filter");
            } else {
                debug!(
                    filter = %filter,
                    state = ?self.state(),
                    "Transport subscription deferred until connected"
                );
            }
        }

        let outcome = self.registry_write().insert(filter, consumer);
        debug!(filter = %filter, ?outcome, "Registered consumer");
        Ok(outcome)
    }

    /// Remove `consumer` from `filter`. Unknown pairs are a no-op.
    ///
    /// Removing the last consumer retracts the transport subscription while
    /// connected. On a transport failure the registry is left unchanged.
    pub async fn unsubscribe(
        &self,
        filter: &str,
        consumer: &ConsumerHandle,
    ) -> AgentResult<UnsubscribeOutcome> {
        let _gate = self.subscription_gate.lock().await;

        let (registered, last_consumer) = {
            let registry = self.registry_read();
            let registered = registry.is_registered(filter, consumer);
            let last = registered
                && registry
                    .snapshot()
                    .consumers(filter)
                    .is_some_and(|consumers| consumers.len() == 1);
            (registered, last)
        };

        if !registered {
            debug!(filter = %filter, consumer = %consumer.name(), "Unsubscribe of unregistered pair ignored");
            return Ok(UnsubscribeOutcome::NotRegistered);
        }

        if last_consumer && self.state().is_connected() {
            self.transport.unsubscribe(filter).await?;
            info!(filter = %filter, "Unsubscribed from filter");
        }

        let outcome = self.registry_write().remove(filter, consumer);
        debug!(filter = %filter, ?outcome, "Removed consumer");
        Ok(outcome)
    }

    /// Store the latest `value` for `topic` and signal the transport.
    ///
    /// The message goes to `<topic>/<agent_id>`, retained, at least once.
    /// `None` stores an empty payload, which clears the retained message on
    /// the broker. Returns the fully-qualified topic.
    pub async fn add_message<T>(&self, topic: &str, value: Option<&T>) -> AgentResult<String>
    where
        T: Serialize + ?Sized,
    {
        let payload = match value {
            Some(value) => match encode_with(self.codec.as_ref(), value) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    error!(topic = %topic, error = %e, "Failed to encode outbox message");
                    return Err(e.into());
                }
            },
            None => None,
        };

        let message = self.outbox.put(topic, payload);
        trace!(topic = %message.topic, bytes = message.payload.len(), "Stored outbox message");

        self.transport.ready_to_publish(&message.topic).await?;
        Ok(message.topic)
    }

    /// Store an empty retained message for `topic`
    pub async fn clear_message(&self, topic: &str) -> AgentResult<String> {
        self.add_message::<()>(topic, None).await
    }

    /// Latest outbox message for a fully-qualified topic
    pub fn message_to_publish(&self, topic: &str) -> Option<OutboxMessage> {
        self.outbox.get(topic)
    }

    /// Decode a payload with the session's codec
    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> AgentResult<T> {
        Ok(decode_with(self.codec.as_ref(), payload)?)
    }

    /// Fan an inbound message out to matching consumers. Returns the number
    /// of deliveries scheduled.
    pub fn handle_message(self: &Arc<Self>, topic: &str, payload: Bytes) -> usize {
        let snapshot = self.registry_read().snapshot();
        let span = crate::dispatch_span!(topic = %topic, bytes = payload.len());
        let _entered = span.enter();
        self.dispatcher.dispatch(self, &snapshot, topic, payload)
    }

    pub(super) fn inbound_handler(&self) -> Arc<dyn InboundHandler> {
        Arc::new(SessionHandler {
            session: self.handle.clone(),
        })
    }

    pub(super) fn registry_read(&self) -> RwLockReadGuard<'_, SubscriptionRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_write(&self) -> RwLockWriteGuard<'_, SubscriptionRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("filters", &self.registry_read().len())
            .field("codec", &self.codec.format())
            .finish_non_exhaustive()
    }
}

/// Transport callback adapter holding only a weak session reference
struct SessionHandler {
    session: Weak<AgentSession>,
}

impl InboundHandler for SessionHandler {
    fn on_message(&self, topic: &str, payload: Bytes) {
        match self.session.upgrade() {
            Some(session) => {
                session.handle_message(topic, payload);
            }
            None => trace!(topic = %topic, "Message for dropped session ignored"),
        }
    }

    fn on_connection_lost(&self, cause: &str) {
        if let Some(session) = self.session.upgrade() {
            session.handle_connection_lost(cause);
        }
    }

    fn on_delivery_complete(&self, packet_id: u16) {
        debug!(packet_id, "Delivery acknowledged");
    }

    fn message_to_publish(&self, topic: &str) -> Option<OutboxMessage> {
        self.session.upgrade()?.message_to_publish(topic)
    }
}
