//! Reconnect supervision after connection loss


use agent_gateway::agent::{
    ConsumerHandle, LifecycleState, ReconnectPolicy, ReconnectSupervisor, SupervisorExit,
};
use agent_gateway::testing::{FailOn, RecordingConsumer};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{connected_session, wait_until};
use tokio::sync::watch;

fn fast_policy(max_attempts: Option<u32>) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        backoff_pattern: vec![5, 10],
        sustained_delay: 10,
    }
}

#[tokio::test]
async fn test_reconnects_after_connection_loss() {
    let (transport, session) = connected_session().await;
    session
        .subscribe("cmd/#", ConsumerHandle::new(RecordingConsumer::new("cmd")))
        .await
        .unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(
        ReconnectSupervisor::new(Arc::clone(&session), fast_policy(None), shutdown_rx).run(),
    );

    transport.drop_connection("broker restarted");

    assert!(wait_until(Duration::from_secs(2), || session.state() == LifecycleState::Connected).await);
    assert_eq!(transport.active_subscriptions(), vec!["cmd/#".to_string()]);

    shutdown_tx.send(true).unwrap();
    assert_eq!(supervisor.await.unwrap(), SupervisorExit::Shutdown);
}

#[tokio::test]
async fn test_retries_until_broker_accepts() {
    let (transport, session) = connected_session().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(
        ReconnectSupervisor::new(Arc::clone(&session), fast_policy(None), shutdown_rx).run(),
    );

    transport.fail_on(FailOn::Connect);
    transport.drop_connection("network down");
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(session.state(), LifecycleState::Disconnected);

    transport.succeed_on(FailOn::Connect);
    assert!(wait_until(Duration::from_secs(2), || session.state() == LifecycleState::Connected).await);

    shutdown_tx.send(true).unwrap();
    supervisor.await.unwrap();
}

#[tokio::test]
async fn test_recovers_when_resubscribe_fails_after_broker_accepts() {
    let (transport, session) = connected_session().await;
    session
        .subscribe("cmd/#", ConsumerHandle::new(RecordingConsumer::new("cmd")))
        .await
        .unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(
        ReconnectSupervisor::new(Arc::clone(&session), fast_policy(None), shutdown_rx).run(),
    );

    transport.fail_on(FailOn::Subscribe);
    transport.drop_connection("broker restarted");
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_ne!(session.state(), LifecycleState::Connected);

    transport.succeed_on(FailOn::Subscribe);
    assert!(wait_until(Duration::from_secs(2), || session.state() == LifecycleState::Connected).await);
    assert_eq!(transport.active_subscriptions(), vec!["cmd/#".to_string()]);

    shutdown_tx.send(true).unwrap();
    assert_eq!(supervisor.await.unwrap(), SupervisorExit::Shutdown);
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let (transport, session) = connected_session().await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(
        ReconnectSupervisor::new(Arc::clone(&session), fast_policy(Some(2)), shutdown_rx).run(),
    );

    transport.fail_on(FailOn::Connect);
    transport.drop_connection("network down");

    let exit = tokio::time::timeout(Duration::from_secs(2), supervisor)
        .await
        .expect("supervisor should give up")
        .unwrap();
    assert_eq!(exit, SupervisorExit::AttemptsExhausted { attempts: 2 });
    assert_eq!(session.state(), LifecycleState::Disconnected);
}

#[tokio::test]
async fn test_shutdown_interrupts_backoff() {
    let (transport, session) = connected_session().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let policy = ReconnectPolicy {
        max_attempts: None,
        backoff_pattern: vec![],
        sustained_delay: 60_000,
    };
    let supervisor =
        tokio::spawn(ReconnectSupervisor::new(Arc::clone(&session), policy, shutdown_rx).run());

    transport.drop_connection("network down");
    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown_tx.send(true).unwrap();

    let exit = tokio::time::timeout(Duration::from_secs(2), supervisor)
        .await
        .expect("shutdown should interrupt the backoff")
        .unwrap();
    assert_eq!(exit, SupervisorExit::Shutdown);
}

#[tokio::test]
async fn test_graceful_disconnect_does_not_trigger_reconnect() {
    let (transport, session) = connected_session().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(
        ReconnectSupervisor::new(Arc::clone(&session), fast_policy(None), shutdown_rx).run(),
    );

    session.disconnect().await.unwrap();
    transport.clear_calls();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(transport.calls().is_empty());
    assert_eq!(session.state(), LifecycleState::Disconnected);

    shutdown_tx.send(true).unwrap();
    supervisor.await.unwrap();
}
