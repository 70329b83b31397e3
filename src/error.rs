//! Error types for the agent gateway
//!
//! Errors scoped to a single message or consumer are logged where they occur
//! and never reach this type's callers. What surfaces here affects the
//! session as a whole, or the single call that produced it.

use crate::agent::lifecycle::LifecycleState;
use crate::protocol::{EncodingError, FilterError};
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for agent session operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid filter '{filter}': {reason}")]
    InvalidFilter {
        filter: String,
        #[source]
        reason: FilterError,
    },

    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl AgentError {
    /// Create invalid filter error
    pub fn invalid_filter<S: Into<String>>(filter: S, reason: FilterError) -> Self {
        Self::InvalidFilter {
            filter: filter.into(),
            reason,
        }
    }

    /// Create invalid state error
    pub fn invalid_state(operation: &'static str, state: LifecycleState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// True when the failure came from the transport collaborator
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result type for agent session operations
pub type AgentResult<T> = Result<T, AgentError>;
