//! Local message consumers
//!
//! A consumer is registered under one or more filters through a
//! [`ConsumerHandle`]. Handles compare by identity: two clones of the same
//! handle are the same consumer, two separately wrapped instances are not,
//! even if they hold equal data.

use super::session::AgentSession;
use bytes::Bytes;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

/// Consumer collaborator invoked for every matching inbound message
#[async_trait::async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Handle one inbound message
    async fn receive(
        &self,
        session: &AgentSession,
        topic: &str,
        payload: Bytes,
    ) -> Result<(), ConsumerError>;

    /// Name used in logs
    fn name(&self) -> &str {
        "consumer"
    }
}

/// Failure raised by a consumer; logged by the dispatcher and never retried
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("{message}")]
    Rejected { message: String },
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ConsumerError {
    pub fn rejected<S: Into<String>>(message: S) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}

/// Identity-compared reference to a registered consumer
#[derive(Clone)]
pub struct ConsumerHandle(Arc<dyn MessageConsumer>);

impl ConsumerHandle {
    pub fn new<C: MessageConsumer + 'static>(consumer: C) -> Self {
        Self(Arc::new(consumer))
    }

    pub fn from_arc(consumer: Arc<dyn MessageConsumer>) -> Self {
        Self(consumer)
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn consumer(&self) -> &Arc<dyn MessageConsumer> {
        &self.0
    }

    // Data pointer only; vtable pointers are not stable across codegen units.
    fn address(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl<C: MessageConsumer + 'static> From<Arc<C>> for ConsumerHandle {
    fn from(consumer: Arc<C>) -> Self {
        Self(consumer)
    }
}

impl PartialEq for ConsumerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for ConsumerHandle {}

impl Hash for ConsumerHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConsumerHandle")
            .field(&self.name())
            .field(&self.address())
            .finish()
    }
}
