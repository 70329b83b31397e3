//! Agent session core
//!
//! A session routes inbound messages from the transport to locally
//! registered consumers, keeps the latest outgoing state per topic for the
//! transport to pull, and announces its own liveness on a status topic.

pub mod consumer;
pub mod dispatch;
pub mod lifecycle;
pub mod outbox;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use consumer::{ConsumerError, ConsumerHandle, MessageConsumer};
pub use dispatch::{DispatchStats, DispatchStatsSnapshot, Dispatcher, WorkerPool};
pub use lifecycle::{Lifecycle, LifecycleEvent, LifecycleState, SessionEvent};
pub use outbox::Outbox;
pub use registry::{RegistrySnapshot, SubscribeOutcome, SubscriptionRegistry, UnsubscribeOutcome};
pub use session::{AgentIdentity, AgentSession};
pub use supervisor::{ReconnectDecision, ReconnectPolicy, ReconnectSupervisor, SupervisorExit};
