//! Concurrent fan-out of inbound messages to consumers
//!
//! ## What it guarantees
//! - `dispatch` returns as soon as the work is scheduled; consumers never run
//!   on the transport's task.
//! - A consumer registered under several matching filters is invoked once
//!   per message.
//! - Consumer errors and panics are caught and logged (isolation).
//!
//! ## What it does **not** guarantee
//! - No ordering among consumers of one message, nor between messages.
//! - No bound on outstanding work; throughput is preferred over backpressure.
//!
//! ```text
//!    dispatch(topic, payload)
//!        │            (snapshot ∩ matching filters, deduplicated)
//!        ├──────────► pool task ─► consumer A.receive()
//!        ├──────────► pool task ─► consumer B.receive()
//!        └──────────► pool task ─► consumer N.receive()
//! ```

use super::consumer::ConsumerHandle;
use super::registry::RegistrySnapshot;
use super::session::AgentSession;
use bytes::Bytes;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// Task-execution service for consumer invocations
///
/// Created at session start and closed at teardown. Cloning shares the same
/// pool. Closing stops new work but never cancels what is already running.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    runtime: Handle,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl WorkerPool {
    /// Pool spawning onto the given runtime
    pub fn new(name: impl Into<String>, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                runtime,
                closed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Pool on the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current(name: impl Into<String>) -> Self {
        Self::new(name, Handle::current())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Schedule one unit of work. Returns false if the pool is closed.
    pub fn spawn<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return false;
        }

        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            work.await;
            if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
        });
        true
    }

    /// Stop accepting work
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!(pool = %self.inner.name, "Worker pool closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Units of work scheduled but not yet finished
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no work is in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait for in-flight work, giving up after `grace`. Returns true if idle.
    pub async fn wait_idle_timeout(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.wait_idle()).await.is_ok()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Dispatch counters
#[derive(Debug, Default)]
pub struct DispatchStats {
    messages_received: AtomicU64,
    messages_ignored: AtomicU64,
    messages_unmatched: AtomicU64,
    deliveries_scheduled: AtomicU64,
    deliveries_rejected: AtomicU64,
    consumer_failures: AtomicU64,
    consumer_panics: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    pub messages_received: u64,
    pub messages_ignored: u64,
    pub messages_unmatched: u64,
    pub deliveries_scheduled: u64,
    pub deliveries_rejected: u64,
    pub consumer_failures: u64,
    pub consumer_panics: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_ignored: self.messages_ignored.load(Ordering::Relaxed),
            messages_unmatched: self.messages_unmatched.load(Ordering::Relaxed),
            deliveries_scheduled: self.deliveries_scheduled.load(Ordering::Relaxed),
            deliveries_rejected: self.deliveries_rejected.load(Ordering::Relaxed),
            consumer_failures: self.consumer_failures.load(Ordering::Relaxed),
            consumer_panics: self.consumer_panics.load(Ordering::Relaxed),
        }
    }
}

/// Fan-out engine owned by the session
#[derive(Debug)]
pub struct Dispatcher {
    pool: WorkerPool,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Schedule delivery of one inbound message. Returns the number of
    /// consumer invocations scheduled.
    pub fn dispatch(
        &self,
        session: &Arc<AgentSession>,
        snapshot: &RegistrySnapshot,
        topic: &str,
        payload: Bytes,
    ) -> usize {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

        if payload.is_empty() {
            self.stats.messages_ignored.fetch_add(1, Ordering::Relaxed);
            debug!(topic = %topic, "Ignoring message without payload");
            return 0;
        }

        let consumers = snapshot.matching_consumers(topic);
        if consumers.is_empty() {
            self.stats.messages_unmatched.fetch_add(1, Ordering::Relaxed);
            debug!(topic = %topic, "No consumer matches topic");
            return 0;
        }

        let mut scheduled = 0;
        for consumer in consumers {
            let delivery = deliver(
                Arc::clone(session),
                Arc::clone(&self.stats),
                consumer,
                topic.to_string(),
                payload.clone(),
            );
            if self.pool.spawn(delivery) {
                scheduled += 1;
            } else {
                self.stats.deliveries_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    pool = %self.pool.name(),
                    topic = %topic,
                    "Worker pool closed, delivery dropped"
                );
            }
        }

        self.stats
            .deliveries_scheduled
            .fetch_add(scheduled as u64, Ordering::Relaxed);
        debug!(topic = %topic, consumers = scheduled, "Dispatched message");
        scheduled
    }
}

/// One isolated consumer invocation
async fn deliver(
    session: Arc<AgentSession>,
    stats: Arc<DispatchStats>,
    consumer: ConsumerHandle,
    topic: String,
    payload: Bytes,
) {
    let invocation = consumer.consumer().receive(&session, &topic, payload);

    match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            stats.consumer_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                consumer = %consumer.name(),
                topic = %topic,
                error = %e,
                "Consumer failed to handle message"
            );
        }
        Err(panic) => {
            stats.consumer_panics.fetch_add(1, Ordering::Relaxed);
            error!(
                consumer = %consumer.name(),
                topic = %topic,
                panic = %panic_message(panic.as_ref()),
                "Consumer panicked while handling message"
            );
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_runs_work_and_becomes_idle() {
        let pool = WorkerPool::current("test");
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            assert!(pool.spawn(async move {
                tokio::task::yield_now().await;
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert!(pool.wait_idle_timeout(Duration::from_secs(2)).await);
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_work() {
        let pool = WorkerPool::current("test");
        pool.close();
        assert!(pool.is_closed());
        assert!(!pool.spawn(async {}));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_close_does_not_cancel_in_flight_work() {
        let pool = WorkerPool::current("test");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let finished = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&finished);
        pool.spawn(async move {
            let _ = rx.await;
            flag.store(true, Ordering::SeqCst);
        });

        pool.close();
        assert_eq!(pool.in_flight(), 1);
        tx.send(()).unwrap();

        assert!(pool.wait_idle_timeout(Duration::from_secs(2)).await);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_wait_idle_timeout_expires_on_stuck_work() {
        let pool = WorkerPool::current("test");
        pool.spawn(std::future::pending::<()>());
        assert!(!pool.wait_idle_timeout(Duration::from_millis(20)).await);
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_stats_start_at_zero() {
        let stats = DispatchStats::default();
        assert_eq!(stats.snapshot(), DispatchStatsSnapshot::default());
    }
}
