//! Reconnect supervision
//!
//! The session itself never reconnects. A [`ReconnectSupervisor`] watches the
//! session's events and, after a connection loss, calls `connect()` again on
//! a backoff schedule until it succeeds, attempts run out or shutdown is
//! requested.

use super::lifecycle::SessionEvent;
use super::session::AgentSession;
use crate::error::AgentError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{error, info, warn, Instrument};

/// Reconnection schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum attempts per outage (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Delays in milliseconds for the first attempts
    pub backoff_pattern: Vec<u64>,
    /// Delay in milliseconds once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![100, 250, 500, 1000],
            sustained_delay: 1000,
        }
    }
}

/// What to do before the next reconnect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

impl ReconnectPolicy {
    /// Delay before `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    /// Decide on the attempt following `attempts_made`
    pub fn decide(&self, attempts_made: u32, shutdown_requested: bool) -> ReconnectDecision {
        if shutdown_requested {
            return ReconnectDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = self.max_attempts {
            if attempts_made >= max_attempts {
                return ReconnectDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = attempts_made + 1;
        ReconnectDecision::Proceed {
            attempt,
            delay_ms: self.calculate_backoff_delay(attempt),
        }
    }

    /// Total backoff across all attempts, None when unlimited
    pub fn max_total_delay(&self) -> Option<u64> {
        self.max_attempts
            .map(|max| (1..=max).map(|attempt| self.calculate_backoff_delay(attempt)).sum())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or omitted for unlimited".to_string());
        }
        if self.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Why [`ReconnectSupervisor::run`] returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    Shutdown,
    AttemptsExhausted { attempts: u32 },
}

/// Reconnects a session after connection loss
///
/// Listens to session events from construction, so a loss that happens
/// before `run` is first polled is not missed.
pub struct ReconnectSupervisor {
    session: Arc<AgentSession>,
    policy: ReconnectPolicy,
    shutdown: watch::Receiver<bool>,
    events: broadcast::Receiver<SessionEvent>,
}

impl ReconnectSupervisor {
    pub fn new(
        session: Arc<AgentSession>,
        policy: ReconnectPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let events = session.subscribe_events();
        Self {
            session,
            policy,
            shutdown,
            events,
        }
    }

    /// Supervise until shutdown or permanent failure
    pub async fn run(mut self) -> SupervisorExit {
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("Reconnect supervisor stopping");
                        return SupervisorExit::Shutdown;
                    }
                }
                event = self.events.recv() => match event {
                    Ok(SessionEvent::ConnectionLost { cause }) => {
                        let span = crate::lifecycle_span!(
                            operation = "reconnect",
                            agent_id = %self.session.agent_id(),
                            cause = %cause
                        );
                        if let Some(exit) = self.reconnect().instrument(span).await {
                            return exit;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Reconnect supervisor lagged behind session events");
                        if !self.session.state().is_connected() {
                            if let Some(exit) = self.reconnect().await {
                                return exit;
                            }
                        }
                    }
                    Err(RecvError::Closed) => return SupervisorExit::Shutdown,
                }
            }
        }
    }

    /// One outage. Returns `None` once reconnected.
    async fn reconnect(&mut self) -> Option<SupervisorExit> {
        let mut attempts = 0;

        loop {
            let shutdown_requested = *self.shutdown.borrow();
            match self.policy.decide(attempts, shutdown_requested) {
                ReconnectDecision::Proceed { attempt, delay_ms } => {
                    attempts = attempt;
                    info!(attempt, delay_ms, "Scheduling reconnect attempt");

                    if !interruptible_sleep(&mut self.shutdown, delay_ms).await {
                        return Some(SupervisorExit::Shutdown);
                    }

                    match self.session.connect().await {
                        Ok(()) => {
                            info!(attempt, "Reconnected");
                            return None;
                        }
                        Err(AgentError::InvalidState { state, .. }) => {
                            info!(?state, "Session already reconnecting or connected");
                            return None;
                        }
                        Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
                    }
                }
                ReconnectDecision::AbortShutdownRequested => return Some(SupervisorExit::Shutdown),
                ReconnectDecision::AbortMaxAttemptsExceeded => {
                    error!(attempts, "Giving up reconnecting");
                    return Some(SupervisorExit::AttemptsExhausted { attempts });
                }
            }
        }
    }
}

/// Sleep `delay_ms`, returning false early if shutdown is requested
async fn interruptible_sleep(shutdown: &mut watch::Receiver<bool>, delay_ms: u64) -> bool {
    let sleep = tokio::time::sleep(Duration::from_millis(delay_ms));
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}
