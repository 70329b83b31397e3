//! rumqttc-backed [`Transport`]
//!
//! Each `connect` creates a fresh `AsyncClient`/`EventLoop` pair and two
//! tasks: the event loop pump, which forwards inbound events to the
//! session's handler, and the publisher, which pulls outbox messages for
//! topics announced through `ready_to_publish`. Topics announced while no
//! connection is up are kept and flushed on the next connect.
//!
//! The event loop is never restarted after an error. Reconnecting is the
//! caller's decision.

use super::connection::{configure_mqtt_options, credentials_from_env, parse_broker_url, ConnectionState};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::transport::{ConnectParams, InboundHandler, QoS, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

/// How long a graceful disconnect waits for the event loop to drain
const DISCONNECT_DRAIN: Duration = Duration::from_secs(2);

/// MQTT transport client
pub struct MqttClient {
    config: MqttSection,
    state: Arc<watch::Sender<ConnectionState>>,
    active: Mutex<Option<ActiveConnection>>,
    pending_topics: Arc<Mutex<Vec<String>>>,
}

/// Everything owned by one live connection
struct ActiveConnection {
    client: AsyncClient,
    ready_tx: mpsc::UnboundedSender<String>,
    closing: Arc<AtomicBool>,
    event_loop_handle: JoinHandle<()>,
}

impl MqttClient {
    /// Create a client for the configured broker. No I/O happens until
    /// `connect`.
    pub fn new(config: MqttSection) -> Result<Self, TransportError> {
        parse_broker_url(&config.broker_url)?;
        let (state, _) = watch::channel(ConnectionState::Idle);

        Ok(Self {
            config,
            state: Arc::new(state),
            active: Mutex::new(None),
            pending_topics: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Topics announced while disconnected, waiting for the next connect
    pub fn pending_topics(&self) -> Vec<String> {
        lock(&self.pending_topics).clone()
    }

    fn take_active(&self) -> Option<ActiveConnection> {
        lock(&self.active).take()
    }

    fn connected_client(&self) -> Result<AsyncClient, TransportError> {
        if !self.connection_state().is_connected() {
            return Err(TransportError::NotConnected);
        }
        lock(&self.active)
            .as_ref()
            .map(|active| active.client.clone())
            .ok_or(TransportError::NotConnected)
    }

    /// Wait for the event loop to report ConnAck, failure or timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let confirmation = async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(TransportError::ConnectionFailed(reason));
                    }
                    ConnectionState::Idle | ConnectionState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::ConnectionFailed(
                        "State channel closed".to_string(),
                    ));
                }
            }
        };

        tokio::time::timeout(timeout, confirmation)
            .await
            .map_err(|_| TransportError::ConnectTimeout(timeout))?
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn queue_pending(pending: &Mutex<Vec<String>>, topic: &str) {
    let mut pending = lock(pending);
    if !pending.iter().any(|queued| queued == topic) {
        pending.push(topic.to_string());
    }
}

/// Pump the event loop until it fails or the broker disconnects
async fn run_event_loop(
    mut event_loop: EventLoop,
    handler: Arc<dyn InboundHandler>,
    state: Arc<watch::Sender<ConnectionState>>,
    closing: Arc<AtomicBool>,
) {
    let mut acknowledged = false;

    loop {
        let polled = event_loop.poll().await;
        let graceful = closing.load(Ordering::SeqCst);

        match polled {
            Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged => {
                    acknowledged = true;
                    state.send_replace(ConnectionState::Connected);
                    info!("MQTT connection acknowledged");
                }
                EventRoute::ConnectionRefused(reason) => {
                    error!(reason = %reason, "MQTT broker refused connection");
                    state.send_replace(ConnectionState::Disconnected(reason));
                    break;
                }
                EventRoute::MessageReceived { topic, payload } => {
                    trace!(topic = %topic, bytes = payload.len(), "Inbound message");
                    handler.on_message(&topic, payload);
                }
                EventRoute::PublishAcknowledged { packet_id } => {
                    handler.on_delivery_complete(packet_id);
                }
                EventRoute::Disconnected(reason) => {
                    let cause = format!("Broker disconnected: {reason}");
                    state.send_replace(ConnectionState::Disconnected(cause.clone()));
                    if acknowledged && !graceful {
                        handler.on_connection_lost(&cause);
                    }
                    break;
                }
                EventRoute::SubscriptionConfirmed { packet_id, filters } => {
                    debug!(packet_id, filters, "Subscription acknowledged");
                }
                EventRoute::InfrastructureEvent(event) => trace!(event = %event, "MQTT event"),
                EventRoute::OutgoingEvent => {}
            },
            Err(e) => {
                let cause = e.to_string();
                state.send_replace(ConnectionState::Disconnected(cause.clone()));
                if graceful {
                    debug!(cause = %cause, "Event loop closed after disconnect");
                } else if acknowledged {
                    warn!(cause = %cause, "MQTT connection lost");
                    handler.on_connection_lost(&cause);
                } else {
                    warn!(cause = %cause, "MQTT connection failed before acknowledgement");
                }
                break;
            }
        }
    }
}

/// Publish outbox messages for announced topics
async fn run_publisher(
    client: AsyncClient,
    handler: Arc<dyn InboundHandler>,
    mut ready_rx: mpsc::UnboundedReceiver<String>,
    pending: Arc<Mutex<Vec<String>>>,
) {
    while let Some(topic) = ready_rx.recv().await {
        let Some(message) = handler.message_to_publish(&topic) else {
            debug!(topic = %topic, "No outbox message for announced topic");
            continue;
        };

        if let Err(e) = client
            .publish(message.topic, message.qos, message.retain, message.payload)
            .await
        {
            warn!(topic = %topic, error = %e, "Outbox publish failed, will retry on next connect");
            queue_pending(&pending, &topic);
        } else {
            trace!(topic = %topic, "Published outbox message");
        }
    }
}

impl MqttClient {
    async fn open(&self, params: ConnectParams) -> Result<(), TransportError> {
        if let Some(stale) = self.take_active() {
            if self.connection_state().is_connected() {
                *lock(&self.active) = Some(stale);
                return Err(TransportError::ConnectionFailed(
                    "Already connected".to_string(),
                ));
            }
            stale.closing.store(true, Ordering::SeqCst);
            stale.event_loop_handle.abort();
        }

        let options = configure_mqtt_options(&self.config, &params, credentials_from_env(&self.config))?;
        let (client, event_loop) = AsyncClient::new(options, self.config.request_capacity);
        let closing = Arc::new(AtomicBool::new(false));

        info!(
            broker = %self.config.broker_url,
            client_id = %params.client_id,
            "Connecting to MQTT broker"
        );

        self.state.send_replace(ConnectionState::Connecting);
        let state_rx = self.state.subscribe();

        let event_loop_handle = tokio::spawn(run_event_loop(
            event_loop,
            Arc::clone(&params.handler),
            Arc::clone(&self.state),
            Arc::clone(&closing),
        ));

        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        if let Err(e) = Self::wait_for_connection_confirmation(state_rx, timeout).await {
            closing.store(true, Ordering::SeqCst);
            event_loop_handle.abort();
            self.state
                .send_replace(ConnectionState::Disconnected(e.to_string()));
            error!(error = %e, "MQTT connect failed");
            return Err(e);
        }

        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_publisher(
            client.clone(),
            Arc::clone(&params.handler),
            ready_rx,
            Arc::clone(&self.pending_topics),
        ));

        let flushed: Vec<String> = lock(&self.pending_topics).drain(..).collect();
        for topic in &flushed {
            let _ = ready_tx.send(topic.clone());
        }
        if !flushed.is_empty() {
            debug!(topics = flushed.len(), "Flushed pending outbox topics");
        }

        *lock(&self.active) = Some(ActiveConnection {
            client,
            ready_tx,
            closing,
            event_loop_handle,
        });

        Ok(())
    }
}

#[async_trait]
impl Transport for MqttClient {
    async fn connect(&self, params: ConnectParams) -> Result<(), TransportError> {
        let span = crate::mqtt_span!(
            operation = "connect",
            broker = %self.config.broker_url,
            client_id = %params.client_id
        );
        self.open(params).instrument(span).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(active) = self.take_active() else {
            debug!("Disconnect without an active connection");
            return Ok(());
        };

        let ActiveConnection {
            client,
            ready_tx,
            closing,
            mut event_loop_handle,
        } = active;

        closing.store(true, Ordering::SeqCst);
        drop(ready_tx);

        let result = client
            .disconnect()
            .await
            .map_err(|e| TransportError::DisconnectFailed(Box::new(e)));

        match tokio::time::timeout(DISCONNECT_DRAIN, &mut event_loop_handle).await {
            Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!(error = %e, "Event loop task ended with error"),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Event loop task didn't shut down gracefully, forcing abort");
                event_loop_handle.abort();
            }
        }

        self.state.send_replace(ConnectionState::Disconnected(
            "Client disconnected".to_string(),
        ));
        info!("MQTT client disconnected");
        result
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        let client = self.connected_client()?;
        client
            .subscribe(filter, qos)
            .instrument(crate::mqtt_span!(operation = "subscribe", filter = %filter))
            .await
            .map_err(|e| TransportError::SubscriptionFailed {
                filter: filter.to_string(),
                source: Box::new(e),
            })
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let client = self.connected_client()?;
        client
            .unsubscribe(filter)
            .instrument(crate::mqtt_span!(operation = "unsubscribe", filter = %filter))
            .await
            .map_err(|e| TransportError::UnsubscriptionFailed {
                filter: filter.to_string(),
                source: Box::new(e),
            })
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        let client = self.connected_client()?;
        client
            .publish(topic, qos, retain, payload)
            .instrument(crate::mqtt_span!(operation = "publish", topic = %topic, retain))
            .await
            .map_err(|e| TransportError::PublishFailed {
                topic: topic.to_string(),
                source: Box::new(e),
            })
    }

    async fn ready_to_publish(&self, topic: &str) -> Result<(), TransportError> {
        let sender = if self.connection_state().is_connected() {
            lock(&self.active)
                .as_ref()
                .map(|active| active.ready_tx.clone())
        } else {
            None
        };

        match sender {
            Some(sender) if sender.send(topic.to_string()).is_ok() => Ok(()),
            _ => {
                debug!(topic = %topic, "Not connected, outbox topic queued for next connect");
                queue_pending(&self.pending_topics, topic);
                Ok(())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connection_state().is_connected() && lock(&self.active).is_some()
    }
}
