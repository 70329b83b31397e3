//! Mock transport and consumers
//!
//! [`MockTransport`] records every call in order and can play the broker's
//! side: deliver inbound messages, drop the connection, pull outbox
//! messages. The consumers record, fail, panic or stall on demand, and
//! [`RejectingCodec`] refuses every encode.

use crate::agent::{AgentSession, ConsumerError, MessageConsumer};
use crate::protocol::{EncodingError, JsonCodec, PayloadCodec};
use crate::transport::{
    ConnectParams, InboundHandler, LastWill, OutboxMessage, QoS, Transport, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One recorded transport call
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Connect {
        client_id: String,
        clean_session: bool,
        last_will: Option<LastWill>,
    },
    Disconnect,
    Subscribe {
        filter: String,
        qos: QoS,
    },
    Unsubscribe {
        filter: String,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    ReadyToPublish {
        topic: String,
    },
}

/// Operations a [`MockTransport`] can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailOn {
    Connect,
    Disconnect,
    Subscribe,
    Unsubscribe,
    Publish,
    ReadyToPublish,
}

/// Recording transport double
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<TransportCall>>,
    failures: Mutex<HashSet<FailOn>>,
    handler: Mutex<Option<Arc<dyn InboundHandler>>>,
    active_subscriptions: Mutex<Vec<String>>,
    connect_delay: Mutex<Option<Duration>>,
    connected: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that fails `operation` from the start
    pub fn failing(operation: FailOn) -> Self {
        let transport = Self::new();
        transport.fail_on(operation);
        transport
    }

    pub fn fail_on(&self, operation: FailOn) {
        lock(&self.failures).insert(operation);
    }

    pub fn succeed_on(&self, operation: FailOn) {
        lock(&self.failures).remove(&operation);
    }

    /// Make `connect` take `delay` before succeeding
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.connect_delay) = Some(delay);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Filters subscribed and not yet unsubscribed, in subscription order.
    /// Duplicates show up as repeated entries.
    pub fn active_subscriptions(&self) -> Vec<String> {
        lock(&self.active_subscriptions).clone()
    }

    pub fn subscribe_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Subscribe { filter, .. } => Some(filter),
                _ => None,
            })
            .collect()
    }

    pub fn unsubscribe_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Unsubscribe { filter } => Some(filter),
                _ => None,
            })
            .collect()
    }

    /// Direct publishes as (topic, payload, retain)
    pub fn published(&self) -> Vec<(String, Bytes, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Publish {
                    topic,
                    payload,
                    retain,
                    ..
                } => Some((topic, payload, retain)),
                _ => None,
            })
            .collect()
    }

    /// Handler received by the latest connect
    pub fn handler(&self) -> Option<Arc<dyn InboundHandler>> {
        lock(&self.handler).clone()
    }

    /// Play an inbound message. Returns false before any connect.
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        match self.handler() {
            Some(handler) => {
                handler.on_message(topic, payload.into());
                true
            }
            None => false,
        }
    }

    /// Drop the connection as a network failure would
    pub fn drop_connection(&self, cause: &str) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.active_subscriptions).clear();
        if let Some(handler) = self.handler() {
            handler.on_connection_lost(cause);
        }
    }

    /// Pull the outbox message for `topic` as the real transport would
    pub fn pull(&self, topic: &str) -> Option<OutboxMessage> {
        self.handler()?.message_to_publish(topic)
    }

    pub fn acknowledge(&self, packet_id: u16) {
        if let Some(handler) = self.handler() {
            handler.on_delivery_complete(packet_id);
        }
    }

    fn record(&self, call: TransportCall) {
        lock(&self.calls).push(call);
    }

    fn should_fail(&self, operation: FailOn) -> bool {
        lock(&self.failures).contains(&operation)
    }

    fn require_connection(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("calls", &lock(&self.calls).len())
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, params: ConnectParams) -> Result<(), TransportError> {
        self.record(TransportCall::Connect {
            client_id: params.client_id.clone(),
            clean_session: params.clean_session,
            last_will: params.last_will.clone(),
        });

        let delay = *lock(&self.connect_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.should_fail(FailOn::Connect) {
            return Err(TransportError::ConnectionFailed(
                "Mock connection failure".to_string(),
            ));
        }

        *lock(&self.handler) = Some(params.handler);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.record(TransportCall::Disconnect);
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.active_subscriptions).clear();

        if self.should_fail(FailOn::Disconnect) {
            return Err(TransportError::DisconnectFailed(
                "Mock disconnect failure".into(),
            ));
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.record(TransportCall::Subscribe {
            filter: filter.to_string(),
            qos,
        });
        self.require_connection()?;

        if self.should_fail(FailOn::Subscribe) {
            return Err(TransportError::SubscriptionFailed {
                filter: filter.to_string(),
                source: "Mock subscription failure".into(),
            });
        }

        lock(&self.active_subscriptions).push(filter.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.record(TransportCall::Unsubscribe {
            filter: filter.to_string(),
        });
        self.require_connection()?;

        if self.should_fail(FailOn::Unsubscribe) {
            return Err(TransportError::UnsubscriptionFailed {
                filter: filter.to_string(),
                source: "Mock unsubscription failure".into(),
            });
        }

        let mut active = lock(&self.active_subscriptions);
        if let Some(index) = active.iter().position(|f| f == filter) {
            active.remove(index);
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        self.require_connection()?;

        if self.should_fail(FailOn::Publish) {
            return Err(TransportError::PublishFailed {
                topic: topic.to_string(),
                source: "Mock publish failure".into(),
            });
        }
        Ok(())
    }

    async fn ready_to_publish(&self, topic: &str) -> Result<(), TransportError> {
        self.record(TransportCall::ReadyToPublish {
            topic: topic.to_string(),
        });

        if self.should_fail(FailOn::ReadyToPublish) {
            return Err(TransportError::PublishFailed {
                topic: topic.to_string(),
                source: "Mock ready-to-publish failure".into(),
            });
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Codec whose encode always fails; decoding falls back to JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectingCodec;

impl PayloadCodec for RejectingCodec {
    fn format(&self) -> &'static str {
        "rejecting"
    }

    fn encode(&self, _value: &Value) -> Result<Bytes, EncodingError> {
        Err(EncodingError::Rejected {
            format: self.format(),
            message: "mock codec refuses to encode".to_string(),
        })
    }

    fn decode(&self, payload: &[u8]) -> Result<Value, EncodingError> {
        JsonCodec.decode(payload)
    }
}

/// Consumer that records every message it receives
#[derive(Debug)]
pub struct RecordingConsumer {
    name: String,
    received: Mutex<Vec<(String, Bytes)>>,
    notify: Notify,
}

impl RecordingConsumer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            received: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    pub fn received(&self) -> Vec<(String, Bytes)> {
        lock(&self.received).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.received).len()
    }

    /// Wait until at least `count` messages arrived. Returns false on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.count() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[async_trait]
impl MessageConsumer for RecordingConsumer {
    async fn receive(
        &self,
        _session: &AgentSession,
        topic: &str,
        payload: Bytes,
    ) -> Result<(), ConsumerError> {
        lock(&self.received).push((topic.to_string(), payload));
        self.notify.notify_waiters();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Consumer that rejects every message
#[derive(Debug, Default)]
pub struct FailingConsumer {
    calls: AtomicUsize,
}

impl FailingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageConsumer for FailingConsumer {
    async fn receive(
        &self,
        _session: &AgentSession,
        topic: &str,
        _payload: Bytes,
    ) -> Result<(), ConsumerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ConsumerError::rejected(format!("refusing message on {topic}")))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Consumer that panics on every message
#[derive(Debug, Default)]
pub struct PanickingConsumer {
    calls: AtomicUsize,
}

impl PanickingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageConsumer for PanickingConsumer {
    async fn receive(
        &self,
        _session: &AgentSession,
        topic: &str,
        _payload: Bytes,
    ) -> Result<(), ConsumerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("consumer exploded on {topic}");
    }

    fn name(&self) -> &str {
        "panicking"
    }
}

/// Consumer that sleeps before completing
#[derive(Debug)]
pub struct SlowConsumer {
    delay: Duration,
    completed: AtomicUsize,
}

impl SlowConsumer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            completed: AtomicUsize::new(0),
        }
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageConsumer for SlowConsumer {
    async fn receive(
        &self,
        _session: &AgentSession,
        _topic: &str,
        _payload: Bytes,
    ) -> Result<(), ConsumerError> {
        tokio::time::sleep(self.delay).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "slow"
    }
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

    fn params() -> ConnectParams {
        ConnectParams {
            client_id: "mock".to_string(),
            clean_session: true,
            last_will: None,
            handler: Arc::new(NullHandler),
        }
    }

    #[tokio::test]
    async fn test_mock_records_calls_in_order() {
        let transport = MockTransport::new();
        transport.connect(params()).await.unwrap();
        transport.subscribe("a/#", QoS::AtLeastOnce).await.unwrap();
        transport.unsubscribe("a/#").await.unwrap();
        transport.disconnect().await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls.len(), 4);
        assert!(matches!(calls[0], TransportCall::Connect { .. }));
        assert_eq!(
            calls[1],
            TransportCall::Subscribe {
                filter: "a/#".to_string(),
                qos: QoS::AtLeastOnce
            }
        );
        assert_eq!(calls[3], TransportCall::Disconnect);
        assert!(transport.active_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_mock_requires_connection_for_subscribe() {
        let transport = MockTransport::new();
        assert!(matches!(
            transport.subscribe("a", QoS::AtLeastOnce).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_mock_failure_toggles() {
        let transport = MockTransport::failing(FailOn::Connect);
        assert!(transport.connect(params()).await.is_err());
        assert!(!transport.is_connected());

        transport.succeed_on(FailOn::Connect);
        assert!(transport.connect(params()).await.is_ok());
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_deliver_before_connect_is_refused() {
        let transport = MockTransport::new();
        assert!(!transport.deliver("a", "1"));
        assert!(transport.pull("a").is_none());
    }

    #[test]
    fn test_rejecting_codec_refuses_encode_but_decodes_json() {
        let codec = RejectingCodec;
        assert!(matches!(
            crate::protocol::encode_with(&codec, &true),
            Err(EncodingError::Rejected { format: "rejecting", .. })
        ));
        let decoded: bool = crate::protocol::decode_with(&codec, b"true").unwrap();
        assert!(decoded);
    }
}
