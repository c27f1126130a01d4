//! Fan-out event bus.
//!
//! Delivery is blocking: [`PubSub::publish`] returns once every live
//! subscriber has accepted the event into its one-slot buffer, so slow
//! subscribers back-pressure the publisher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Content-free notification about a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// What happened: `added`, `running`, or a status name.
    pub action: String,
    /// Task concerned.
    pub id: Uuid,
}

impl Event {
    /// Build an event.
    pub fn new(action: impl Into<String>, id: Uuid) -> Self {
        Self {
            action: action.into(),
            id,
        }
    }
}

struct Inner {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Event>>>,
    next_id: AtomicU64,
    active: AtomicUsize,
    closed: Notify,
}

/// Dynamic fan-out point. Cloning shares the subscriber table.
#[derive(Clone)]
pub struct PubSub {
    inner: Arc<Inner>,
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSub {
    /// Create a bus without subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                closed: Notify::new(),
            }),
        }
    }

    /// Register a subscriber living until `scope` is cancelled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, scope: &CancellationToken) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(1);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut subscribers = self.inner.subscribers.lock();
            subscribers.insert(id, tx);
            subscribers.len()
        };
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        tracing::info!(subscription = id, subscribers = count, "opening subscription");

        let inner = Arc::clone(&self.inner);
        let scope = scope.clone();
        tokio::spawn(async move {
            scope.cancelled().await;
            inner.subscribers.lock().remove(&id);
            inner.active.fetch_sub(1, Ordering::AcqRel);
            inner.closed.notify_waiters();
            tracing::info!(subscription = id, "closing subscription");
        });
        rx
    }

    /// Number of live subscriptions.
    pub fn subscribers(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Deliver `event` to every current subscriber.
    pub async fn publish(&self, event: Event) {
        let targets: Vec<(u64, mpsc::Sender<Event>)> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut worst = Duration::ZERO;
        for (id, tx) in &targets {
            let started = Instant::now();
            if tx.send(event.clone()).await.is_err() {
                tracing::debug!(subscription = id, "subscriber dropped its receiver");
            }
            worst = worst.max(started.elapsed());
        }
        tracing::debug!(
            action = %event.action,
            task = %event.id,
            subscribers = targets.len(),
            worst_ms = u64::try_from(worst.as_millis()).unwrap_or(u64::MAX),
            "published"
        );
    }

    /// Block until every subscription has terminated.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.closed.notified();
            if self.inner.active.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}
