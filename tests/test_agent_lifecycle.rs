//! Connect, disconnect and connection-loss behaviour of an agent session


use agent_gateway::agent::{
    AgentIdentity, AgentSession, ConsumerHandle, LifecycleState, SessionEvent, WorkerPool,
};
use agent_gateway::testing::{
    FailOn, MockTransport, RecordingConsumer, RejectingCodec, SlowConsumer, TransportCall,
};
use agent_gateway::transport::QoS;
use agent_gateway::AgentError;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{connected_session, test_session, AGENT_ID, SESSION_ID, STATUS_TOPIC};

#[tokio::test]
async fn test_connect_sequence() {
    let (transport, session) = test_session();
    session
        .subscribe("cmd/#", ConsumerHandle::new(RecordingConsumer::new("cmd")))
        .await
        .unwrap();

    session.connect().await.unwrap();

    let calls = transport.calls();
    assert_eq!(calls.len(), 3);

    match &calls[0] {
        TransportCall::Connect {
            client_id,
            clean_session,
            last_will,
        } => {
            assert_eq!(client_id, SESSION_ID);
            assert!(clean_session);
            let will = last_will.as_ref().expect("last will registered");
            assert_eq!(will.topic, STATUS_TOPIC);
            assert_eq!(will.payload, Bytes::from("false"));
            assert_eq!(will.qos, QoS::AtLeastOnce);
            assert!(will.retain);
        }
        other => panic!("expected connect first, got {other:?}"),
    }

    assert_eq!(
        calls[1],
        TransportCall::Publish {
            topic: STATUS_TOPIC.to_string(),
            payload: Bytes::from("true"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }
    );
    assert_eq!(
        calls[2],
        TransportCall::Subscribe {
            filter: "cmd/#".to_string(),
            qos: QoS::AtLeastOnce
        }
    );
    assert_eq!(session.state(), LifecycleState::Connected);
}

#[tokio::test]
async fn test_disconnect_sequence() {
    let (transport, session) = connected_session().await;
    session
        .subscribe("a", ConsumerHandle::new(RecordingConsumer::new("a")))
        .await
        .unwrap();
    session
        .subscribe("b/+", ConsumerHandle::new(RecordingConsumer::new("b")))
        .await
        .unwrap();
    transport.clear_calls();

    session.disconnect().await.unwrap();

    let calls = transport.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(
        calls[0],
        TransportCall::Publish {
            topic: STATUS_TOPIC.to_string(),
            payload: Bytes::from("false"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }
    );
    let mut unsubscribed = transport.unsubscribe_calls();
    unsubscribed.sort();
    assert_eq!(unsubscribed, vec!["a".to_string(), "b/+".to_string()]);
    assert_eq!(calls[3], TransportCall::Disconnect);

    assert_eq!(session.state(), LifecycleState::Disconnected);
    // Registrations survive for the next connect
    assert_eq!(session.filters().len(), 2);
}

#[tokio::test]
async fn test_disconnect_continues_past_unsubscribe_failures() {
    let (transport, session) = connected_session().await;
    session
        .subscribe("a", ConsumerHandle::new(RecordingConsumer::new("a")))
        .await
        .unwrap();
    transport.fail_on(FailOn::Unsubscribe);
    transport.fail_on(FailOn::Publish);

    session.disconnect().await.unwrap();

    assert_eq!(transport.calls().last(), Some(&TransportCall::Disconnect));
    assert_eq!(session.state(), LifecycleState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_failure_propagates_and_ends_disconnected() {
    let (transport, session) = connected_session().await;
    transport.fail_on(FailOn::Disconnect);

    let result = session.disconnect().await;

    assert!(matches!(result, Err(AgentError::Transport(_))));
    assert_eq!(session.state(), LifecycleState::Disconnected);
}

#[tokio::test]
async fn test_connect_failure_returns_to_disconnected() {
    let (transport, session) = test_session();
    transport.fail_on(FailOn::Connect);

    let result = session.connect().await;

    assert!(matches!(result, Err(AgentError::Transport(_))));
    assert_eq!(session.state(), LifecycleState::Disconnected);

    transport.succeed_on(FailOn::Connect);
    session.connect().await.unwrap();
    assert_eq!(session.state(), LifecycleState::Connected);
}

#[tokio::test]
async fn test_liveness_publish_failure_rolls_connect_back() {
    let (transport, session) = test_session();
    session
        .subscribe("a/#", ConsumerHandle::new(RecordingConsumer::new("first")))
        .await
        .unwrap();
    transport.fail_on(FailOn::Publish);

    let result = session.connect().await;

    assert!(matches!(result, Err(AgentError::Transport(_))));
    assert_eq!(session.state(), LifecycleState::Disconnected);
    assert_eq!(transport.calls().last(), Some(&TransportCall::Disconnect));
    assert!(!transport.subscribe_calls().contains(&"a/#".to_string()));

    // A second consumer while disconnected stays deferred; the retry
    // runs the whole connect sequence again
    transport.succeed_on(FailOn::Publish);
    session
        .subscribe("a/#", ConsumerHandle::new(RecordingConsumer::new("second")))
        .await
        .unwrap();
    session.connect().await.unwrap();

    assert_eq!(session.state(), LifecycleState::Connected);
    assert_eq!(transport.active_subscriptions(), session.filters());
}

#[tokio::test]
async fn test_resubscribe_failure_rolls_connect_back() {
    let (transport, session) = test_session();
    session
        .subscribe("a", ConsumerHandle::new(RecordingConsumer::new("a")))
        .await
        .unwrap();
    session
        .subscribe("b/+", ConsumerHandle::new(RecordingConsumer::new("b")))
        .await
        .unwrap();
    transport.fail_on(FailOn::Subscribe);
    let mut events = session.subscribe_events();

    let result = session.connect().await;

    assert!(matches!(result, Err(AgentError::Transport(_))));
    assert_eq!(session.state(), LifecycleState::Disconnected);
    assert_eq!(transport.calls().last(), Some(&TransportCall::Disconnect));
    assert!(transport.active_subscriptions().is_empty());
    assert!(events.try_recv().is_err());

    transport.succeed_on(FailOn::Subscribe);
    session.connect().await.unwrap();

    let mut active = transport.active_subscriptions();
    active.sort();
    assert_eq!(active, vec!["a".to_string(), "b/+".to_string()]);
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);
}

#[tokio::test]
async fn test_unencodable_liveness_does_not_abort_connect() {
    let transport = Arc::new(MockTransport::new());
    let session = AgentSession::with_codec(
        AgentIdentity::new(AGENT_ID, SESSION_ID),
        transport.clone(),
        WorkerPool::current("test-consumers"),
        Arc::new(RejectingCodec),
    );
    session
        .subscribe("cmd/#", ConsumerHandle::new(RecordingConsumer::new("cmd")))
        .await
        .unwrap();

    session.connect().await.unwrap();

    assert_eq!(
        transport.calls(),
        vec![
            TransportCall::Connect {
                client_id: SESSION_ID.to_string(),
                clean_session: true,
                last_will: None,
            },
            TransportCall::Subscribe {
                filter: "cmd/#".to_string(),
                qos: QoS::AtLeastOnce
            },
        ]
    );
    assert!(transport.published().is_empty());
    assert_eq!(session.state(), LifecycleState::Connected);

    transport.clear_calls();
    session.disconnect().await.unwrap();
    assert_eq!(
        transport.calls(),
        vec![
            TransportCall::Unsubscribe {
                filter: "cmd/#".to_string()
            },
            TransportCall::Disconnect,
        ]
    );
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let (transport, session) = connected_session().await;

    let result = session.connect().await;

    assert!(matches!(
        result,
        Err(AgentError::InvalidState {
            state: LifecycleState::Connected,
            ..
        })
    ));
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_disconnect_while_disconnected_is_a_noop() {
    let (transport, session) = test_session();

    session.disconnect().await.unwrap();

    assert!(transport.calls().is_empty());
    assert_eq!(session.state(), LifecycleState::Disconnected);
}

#[tokio::test]
async fn test_state_watch_follows_transitions() {
    let (_transport, session) = test_session();
    let mut state = session.watch_state();
    assert_eq!(*state.borrow_and_update(), LifecycleState::Disconnected);

    session.connect().await.unwrap();
    assert!(state.has_changed().unwrap());
    assert_eq!(*state.borrow_and_update(), LifecycleState::Connected);

    session.disconnect().await.unwrap();
    assert_eq!(*state.borrow_and_update(), LifecycleState::Disconnected);
}

#[tokio::test]
async fn test_connection_loss_emits_event_and_disconnects() {
    let (transport, session) = connected_session().await;
    let mut events = session.subscribe_events();

    transport.drop_connection("keep-alive timeout");

    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::ConnectionLost {
            cause: "keep-alive timeout".to_string()
        }
    );
    assert_eq!(session.state(), LifecycleState::Disconnected);
}

#[tokio::test]
async fn test_connection_loss_while_disconnected_is_ignored() {
    let (transport, session) = connected_session().await;
    session.disconnect().await.unwrap();
    let mut events = session.subscribe_events();

    transport.drop_connection("late callback");

    assert!(events.try_recv().is_err());
    assert_eq!(session.state(), LifecycleState::Disconnected);
}

#[tokio::test]
async fn test_reconnect_restores_subscriptions() {
    let (transport, session) = connected_session().await;
    session
        .subscribe("a/#", ConsumerHandle::new(RecordingConsumer::new("a")))
        .await
        .unwrap();
    transport.drop_connection("network down");
    assert!(transport.active_subscriptions().is_empty());

    session.connect().await.unwrap();

    assert_eq!(transport.active_subscriptions(), vec!["a/#".to_string()]);
}

#[tokio::test]
async fn test_connected_event_is_broadcast() {
    let (_transport, session) = test_session();
    let mut events = session.subscribe_events();

    session.connect().await.unwrap();
    session.disconnect().await.unwrap();

    assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Disconnected);
}

#[tokio::test]
async fn test_shutdown_waits_for_running_consumers() {
    let (transport, session) = connected_session().await;
    let slow = Arc::new(SlowConsumer::new(Duration::from_millis(100)));
    session
        .subscribe("work", ConsumerHandle::from(slow.clone()))
        .await
        .unwrap();

    transport.deliver("work", "job");
    session.shutdown(Duration::from_secs(2)).await.unwrap();

    assert_eq!(slow.completed(), 1);
    assert_eq!(session.state(), LifecycleState::Disconnected);
    assert!(session.pool().is_closed());
}
