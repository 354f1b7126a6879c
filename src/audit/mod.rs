//! Fire-and-forget audit event recording.
//!
//! The enforcement adapter must never stall on audit persistence, so events
//! land in a bounded in-memory queue and a background writer drains them
//! into the audit store. Overflow drops the oldest event and logs; write
//! failures are logged and swallowed. Queries and statistics go straight to
//! the store (see [`crate::store::AuditStore`]).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::model::AuditEvent;
use crate::store::AuditStore;

/// Default bound on the in-memory audit queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

struct Inner {
    queue: Mutex<VecDeque<AuditEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

/// Producer handle for audit events.
///
/// Cloning is cheap; every clone feeds the same queue.
#[derive(Clone)]
pub struct AuditPipeline {
    inner: Arc<Inner>,
}

impl AuditPipeline {
    /// Create a pipeline with the given queue bound.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue one event without blocking.
    ///
    /// When the queue is full the oldest event is dropped so the decision
    /// path never waits on audit capacity.
    pub fn record(&self, event: AuditEvent) {
        let Ok(mut queue) = self.inner.queue.lock() else {
            warn!("audit queue lock poisoned; event dropped");
            return;
        };
        if queue.len() >= self.inner.capacity {
            queue.pop_front();
            let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped_total = dropped, "audit queue full, oldest event dropped");
        }
        queue.push_back(event);
        drop(queue);
        self.inner.notify.notify_one();
    }

    /// Total events dropped to overflow since startup.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Events currently waiting to be written.
    pub fn backlog(&self) -> usize {
        self.inner.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Spawn the background writer.
    ///
    /// The writer drains the queue into `store` until shutdown is signalled,
    /// then makes a final drain pass so a clean shutdown loses nothing.
    pub fn spawn_writer(
        &self,
        store: Arc<dyn AuditStore>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.notify.notified() => {
                        drain(&inner, store.as_ref()).await;
                    }
                    _ = shutdown.changed() => {
                        drain(&inner, store.as_ref()).await;
                        debug!("audit writer stopped");
                        return;
                    }
                }
            }
        })
    }
}

async fn drain(inner: &Inner, store: &dyn AuditStore) {
    loop {
        let event = {
            let Ok(mut queue) = inner.queue.lock() else {
                return;
            };
            queue.pop_front()
        };
        let Some(event) = event else {
            return;
        };
        if let Err(e) = store.insert(&event).await {
            // Best effort only: audit persistence must never fail a decision.
            warn!(error = %e, event_id = %event.id, "audit write failed");
        }
    }
}
