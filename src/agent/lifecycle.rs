//! Connection lifecycle of an agent session
//!
//! States move through a pure transition table ([`LifecycleState::next`]).
//! The current state is published on a `watch` channel and every completed
//! transition of interest is broadcast as a [`SessionEvent`].
//!
//! ```text
//!  Disconnected ──connect──► Connecting ──broker ack──► Connected
//!       ▲                        │                        │  │
//!       └────── connect failed ──┘        connection lost ┘  │ disconnect
//!       ▲                                                    ▼
//!       └──────────────── transport closed ────────── Disconnecting
//! ```

use super::session::AgentSession;
use crate::error::{AgentError, AgentResult};
use crate::protocol::encode_with;
use crate::transport::{ConnectParams, LastWill, TransportError, CORE_QOS};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the session event broadcast
const EVENT_CAPACITY: usize = 32;

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LifecycleState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Inputs to the lifecycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    ConnectRequested,
    TransportConnected,
    ConnectFailed,
    DisconnectRequested,
    TransportClosed,
    ConnectionLost,
}

impl LifecycleState {
    /// State after `event`, or `None` if the event is not valid here
    pub fn next(self, event: LifecycleEvent) -> Option<LifecycleState> {
        use LifecycleEvent::*;
        use LifecycleState::*;

        match (self, event) {
            (Disconnected, ConnectRequested) => Some(Connecting),
            (Connecting, TransportConnected) => Some(Connected),
            (Connecting, ConnectFailed) => Some(Disconnected),
            (Connecting, ConnectionLost) => Some(Disconnected),
            (Connected, DisconnectRequested) => Some(Disconnecting),
            (Connected, ConnectionLost) => Some(Disconnected),
            (Disconnecting, TransportClosed) => Some(Disconnected),
            _ => None,
        }
    }

    pub fn is_connected(self) -> bool {
        self == LifecycleState::Connected
    }
}

/// Notification broadcast to observers of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Session connected, liveness announced, subscriptions issued
    Connected,
    /// Graceful disconnect completed
    Disconnected,
    /// Transport dropped the connection without a disconnect request
    ConnectionLost { cause: String },
}

/// State holder shared by the session and its observers
#[derive(Debug)]
pub struct Lifecycle {
    state: watch::Sender<LifecycleState>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { state, events }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Apply `event` atomically.
    ///
    /// Returns the new state, or the unchanged current state as the error
    /// when the transition is not allowed.
    pub fn apply(&self, event: LifecycleEvent) -> Result<LifecycleState, LifecycleState> {
        let mut outcome = Err(LifecycleState::Disconnected);
        self.state.send_if_modified(|state| match state.next(event) {
            Some(next) => {
                debug!(from = ?*state, to = ?next, ?event, "Lifecycle transition");
                *state = next;
                outcome = Ok(next);
                true
            }
            None => {
                outcome = Err(*state);
                false
            }
        });
        outcome
    }

    pub fn emit(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

impl AgentSession {
    /// Connect the session.
    ///
    /// Sequence: transport connect (with a retained `false` last will), then
    /// a retained `true` on the status topic, then one transport subscription
    /// per registered filter. If the publish or a subscription fails the
    /// transport is closed again and the session is left Disconnected.
    pub async fn connect(&self) -> AgentResult<()> {
        let span = crate::lifecycle_span!(
            operation = "connect",
            agent_id = %self.identity.agent_id,
            session_id = %self.identity.session_id
        );
        self.connect_inner().instrument(span).await
    }

    async fn connect_inner(&self) -> AgentResult<()> {
        self.lifecycle
            .apply(LifecycleEvent::ConnectRequested)
            .map_err(|state| AgentError::invalid_state("connect", state))?;

        let params = ConnectParams {
            client_id: self.identity.session_id.clone(),
            clean_session: true,
            last_will: self.last_will(),
            handler: self.inbound_handler(),
        };

        info!("Connecting agent session");
        if let Err(e) = self.transport.connect(params).await {
            let _ = self.lifecycle.apply(LifecycleEvent::ConnectFailed);
            error!(error = %e, "Transport connect failed");
            return Err(e.into());
        }

        // Held until every registered filter is subscribed, so a concurrent
        // subscribe cannot issue a duplicate transport subscription
        let _gate = self.subscription_gate.lock().await;

        // Still Connecting here: the session only counts as Connected once
        // liveness is announced and every registered filter is subscribed
        let filters = self.registry_read().filters();
        if let Err(e) = self.establish(&filters).await {
            error!(error = %e, "Session setup failed, closing transport");
            if let Err(close) = self.transport.disconnect().await {
                warn!(error = %close, "Failed to close transport after setup failure");
            }
            let _ = self.lifecycle.apply(LifecycleEvent::ConnectFailed);
            return Err(e.into());
        }

        if let Err(state) = self.lifecycle.apply(LifecycleEvent::TransportConnected) {
            warn!(?state, "Connection dropped before the session was established");
            return Err(TransportError::ConnectionLost(
                "connection dropped while connecting".to_string(),
            )
            .into());
        }

        self.lifecycle.emit(SessionEvent::Connected);
        info!(subscriptions = filters.len(), "Agent session connected");
        Ok(())
    }

    /// Announce liveness, then issue one transport subscription per filter
    async fn establish(&self, filters: &[String]) -> Result<(), TransportError> {
        self.publish_liveness(true).await?;

        for filter in filters {
            self.transport.subscribe(filter, CORE_QOS).await?;
            debug!(filter = %filter, "Subscribed registered filter");
        }
        Ok(())
    }

    /// Disconnect the session. A no-op when already disconnected.
    ///
    /// Publishes a retained `false` on the status topic, retracts every
    /// transport subscription, then closes the transport. Registry entries
    /// are kept so a later connect restores them.
    pub async fn disconnect(&self) -> AgentResult<()> {
        let span = crate::lifecycle_span!(
            operation = "disconnect",
            agent_id = %self.identity.agent_id,
            session_id = %self.identity.session_id
        );
        self.disconnect_inner().instrument(span).await
    }

    async fn disconnect_inner(&self) -> AgentResult<()> {
        let _gate = self.subscription_gate.lock().await;

        match self.lifecycle.apply(LifecycleEvent::DisconnectRequested) {
            Ok(_) => {}
            Err(LifecycleState::Disconnected) => {
                debug!("Disconnect requested while already disconnected");
                return Ok(());
            }
            Err(state) => return Err(AgentError::invalid_state("disconnect", state)),
        }

        info!("Disconnecting agent session");

        if let Err(e) = self.publish_liveness(false).await {
            warn!(error = %e, "Failed to publish offline status");
        }

        let filters = self.registry_read().filters();
        for filter in filters {
            if let Err(e) = self.transport.unsubscribe(&filter).await {
                warn!(filter = %filter, error = %e, "Failed to unsubscribe during disconnect");
            }
        }

        let result = self.transport.disconnect().await;
        let _ = self.lifecycle.apply(LifecycleEvent::TransportClosed);
        self.lifecycle.emit(SessionEvent::Disconnected);

        match result {
            Ok(()) => {
                info!("Agent session disconnected");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Transport disconnect failed");
                Err(e.into())
            }
        }
    }

    /// Disconnect if connected, close the worker pool and wait up to
    /// `grace` for in-flight deliveries
    pub async fn shutdown(&self, grace: Duration) -> AgentResult<()> {
        let result = match self.state() {
            LifecycleState::Connected => self.disconnect().await,
            _ => Ok(()),
        };

        let pool = self.dispatcher.pool();
        pool.close();
        if !pool.wait_idle_timeout(grace).await {
            warn!(
                in_flight = pool.in_flight(),
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "Consumers still running after shutdown grace period"
            );
        }

        result
    }

    /// Transport-reported connection loss
    pub(crate) fn handle_connection_lost(&self, cause: &str) {
        match self.lifecycle.apply(LifecycleEvent::ConnectionLost) {
            Ok(_) => {
                warn!(
                    agent_id = %self.identity.agent_id,
                    cause = %cause,
                    "Connection lost"
                );
                self.lifecycle.emit(SessionEvent::ConnectionLost {
                    cause: cause.to_string(),
                });
            }
            Err(state) => {
                debug!(?state, cause = %cause, "Ignoring connection loss outside an active connection");
            }
        }
    }

    /// Retained `false` registered as the last will; dropped if unencodable
    fn last_will(&self) -> Option<LastWill> {
        match encode_with(self.codec.as_ref(), &false) {
            Ok(payload) => Some(LastWill {
                topic: self.identity.status_topic.clone(),
                payload,
                qos: CORE_QOS,
                retain: true,
            }),
            Err(e) => {
                error!(error = %e, "Failed to encode last will, connecting without one");
                None
            }
        }
    }

    /// Publish the liveness flag, retained. Encoding failures are logged.
    async fn publish_liveness(&self, online: bool) -> Result<(), TransportError> {
        let payload = match encode_with(self.codec.as_ref(), &online) {
            Ok(payload) => payload,
            Err(e) => {
                error!(online, error = %e, "Failed to encode liveness flag");
                return Ok(());
            }
        };

        self.transport
            .publish(&self.identity.status_topic, payload, CORE_QOS, true)
            .await?;
        debug!(topic = %self.identity.status_topic, online, "Published liveness flag");
        Ok(())
    }
}
