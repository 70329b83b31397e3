//! Outbox: latest retained state per topic, pulled by the transport


use agent_gateway::testing::{FailOn, TransportCall};
use agent_gateway::transport::QoS;
use agent_gateway::AgentError;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use test_helpers::{connected_session, test_session};

#[derive(Serialize)]
struct Reading {
    celsius: f64,
    sensor: &'static str,
}

#[tokio::test]
async fn test_add_message_signals_transport_with_qualified_topic() {
    let (transport, session) = connected_session().await;

    let topic = session.add_message("state", Some(&"on")).await.unwrap();

    assert_eq!(topic, "state/lamp-1");
    assert_eq!(
        transport.calls(),
        vec![TransportCall::ReadyToPublish {
            topic: "state/lamp-1".to_string()
        }]
    );
}

#[tokio::test]
async fn test_pulled_message_is_retained_at_least_once() {
    let (transport, session) = connected_session().await;
    let reading = Reading {
        celsius: 21.5,
        sensor: "kitchen",
    };

    session.add_message("readings", Some(&reading)).await.unwrap();

    let message = transport.pull("readings/lamp-1").expect("message stored");
    assert_eq!(message.topic, "readings/lamp-1");
    assert_eq!(
        message.payload,
        Bytes::from(r#"{"celsius":21.5,"sensor":"kitchen"}"#)
    );
    assert_eq!(message.qos, QoS::AtLeastOnce);
    assert!(message.retain);
}

#[tokio::test]
async fn test_latest_value_wins() {
    let (transport, session) = connected_session().await;

    session.add_message("level", Some(&1)).await.unwrap();
    session.add_message("level", Some(&2)).await.unwrap();
    session.add_message("level", Some(&3)).await.unwrap();

    let message = transport.pull("level/lamp-1").unwrap();
    assert_eq!(message.payload, Bytes::from("3"));
}

#[tokio::test]
async fn test_clear_message_stores_empty_payload() {
    let (transport, session) = connected_session().await;
    session.add_message("state", Some(&"on")).await.unwrap();

    session.clear_message("state").await.unwrap();

    let message = transport.pull("state/lamp-1").unwrap();
    assert!(message.payload.is_empty());
    assert!(message.retain);
}

#[tokio::test]
async fn test_unknown_topic_pulls_nothing() {
    let (transport, session) = connected_session().await;
    session.add_message("state", Some(&"on")).await.unwrap();

    assert!(transport.pull("state").is_none());
    assert!(session.message_to_publish("other/lamp-1").is_none());
}

#[tokio::test]
async fn test_unencodable_value_is_rejected_before_signalling() {
    let (transport, session) = connected_session().await;
    let mut value = HashMap::new();
    value.insert((1, 2), "tuple keys have no JSON form");

    let result = session.add_message("grid", Some(&value)).await;

    assert!(matches!(result, Err(AgentError::Encoding(_))));
    assert!(transport.calls().is_empty());
    assert!(session.message_to_publish("grid/lamp-1").is_none());
}

#[tokio::test]
async fn test_signal_failure_propagates_but_message_is_kept() {
    let (transport, session) = connected_session().await;
    transport.fail_on(FailOn::ReadyToPublish);

    let result = session.add_message("state", Some(&"off")).await;

    assert!(matches!(result, Err(AgentError::Transport(_))));
    let message = session.message_to_publish("state/lamp-1").unwrap();
    assert_eq!(message.payload, Bytes::from(r#""off""#));
}

#[tokio::test]
async fn test_messages_can_be_added_while_disconnected() {
    let (transport, session) = test_session();

    session.add_message("state", Some(&true)).await.unwrap();

    assert_eq!(
        transport.calls(),
        vec![TransportCall::ReadyToPublish {
            topic: "state/lamp-1".to_string()
        }]
    );
    assert_eq!(
        session.message_to_publish("state/lamp-1").unwrap().payload,
        Bytes::from("true")
    );
}
