//! Debounced, deduplicating buffer of pending sync actions.
//!
//! [`SyncQueue::enqueue`] runs on the business mutation path: it folds the
//! operation into an in-memory buffer keyed by `entityType:id` and re-arms a
//! single debounce timer shared by every key. No I/O happens there. When the
//! timer fires, [`SyncQueue::flush`] drains a snapshot of the buffer and runs
//! the [`SyncAction`] for each entry in turn.
//!
//! Delivery is at-most-once: a failed entry is logged and dropped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::capture::ChangeSink;
use crate::error::{MirrorError, MirrorResult};
use crate::models::{queue_key, ChangeEvent, EntityKind, Operation, QueuedOperation};
use crate::sync::{SyncAction, SyncOutcome};

/// Counts for one flush pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct QueueState {
    buffer: HashMap<String, QueuedOperation>,
    pending: HashSet<String>,
    timer: Option<Timer>,
    generation: u64,
}

struct QueueInner {
    action: Arc<dyn SyncAction>,
    debounce: Duration,
    runtime: Handle,
    state: Mutex<QueueState>,
}

impl QueueInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloning shares the same buffer and timer.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<QueueInner>,
}

impl SyncQueue {
    /// Build a queue driven by the current tokio runtime.
    pub fn new(action: Arc<dyn SyncAction>, debounce: Duration) -> MirrorResult<Self> {
        let runtime = Handle::try_current().map_err(|_| MirrorError::NoRuntime)?;
        Ok(Self::with_runtime(action, debounce, runtime))
    }

    pub fn with_runtime(action: Arc<dyn SyncAction>, debounce: Duration, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                action,
                debounce,
                runtime,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Buffer an operation and re-arm the shared timer. The last operation
    /// for a key replaces any earlier buffered one.
    pub fn enqueue(
        &self,
        kind: EntityKind,
        id: impl Into<String>,
        operation: Operation,
        payload: Option<Value>,
    ) {
        let id = id.into();
        let key = queue_key(kind, &id);
        let mut state = self.inner.state();
        state.pending.insert(key.clone());
        state.buffer.insert(
            key,
            QueuedOperation {
                kind,
                id,
                operation,
                payload,
            },
        );
        self.arm_timer(&mut state);
    }

    fn arm_timer(&self, state: &mut QueueState) {
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
        state.generation += 1;
        let generation = state.generation;

        let queue = self.clone();
        let debounce = self.inner.debounce;
        let handle = self.inner.runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            queue.on_timer(generation).await;
        });
        state.timer = Some(Timer { generation, handle });
    }

    async fn on_timer(&self, generation: u64) {
        {
            let mut state = self.inner.state();
            // Superseded by a later enqueue or a manual flush.
            if state.timer.as_ref().map(|t| t.generation) != Some(generation) {
                return;
            }
            state.timer = None;
        }
        self.run_batch().await;
    }

    /// Cancel the timer and sync every buffered entry.
    pub async fn flush(&self) -> FlushSummary {
        if let Some(timer) = self.inner.state().timer.take() {
            timer.handle.abort();
        }
        self.run_batch().await
    }

    async fn run_batch(&self) -> FlushSummary {
        let mut batch: Vec<(String, QueuedOperation)> = {
            let mut state = self.inner.state();
            state.buffer.drain().collect()
        };
        batch.sort_by(|a, b| a.0.cmp(&b.0));

        let mut summary = FlushSummary {
            attempted: batch.len(),
            ..FlushSummary::default()
        };

        for (key, op) in &batch {
            match self.inner.action.execute(op).await {
                Ok(outcome) => {
                    summary.succeeded += 1;
                    if let SyncOutcome::Mirrored(report) = outcome {
                        debug!(key = %key, written = report.written, "synced");
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    let transient = e
                        .downcast_ref::<MirrorError>()
                        .map_or(false, MirrorError::is_transient);
                    warn!(key = %key, transient, error = %format!("{:#}", e), "sync failed, entry dropped");
                }
            }
        }

        // Keys re-buffered during the batch stay pending for the next timer.
        {
            let mut state = self.inner.state();
            for (key, _) in &batch {
                if !state.buffer.contains_key(key) {
                    state.pending.remove(key);
                }
            }
        }

        if summary.attempted > 0 {
            debug!(
                attempted = summary.attempted,
                failed = summary.failed,
                "flush complete"
            );
        }
        summary
    }

    /// Flush whatever is left. Call before dropping the last handle.
    pub async fn shutdown(&self) -> FlushSummary {
        self.flush().await
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state().pending.len()
    }

    pub fn is_pending(&self, kind: EntityKind, id: &str) -> bool {
        self.inner.state().pending.contains(&queue_key(kind, id))
    }

    /// The operation currently buffered for an entity, if any.
    pub fn buffered(&self, kind: EntityKind, id: &str) -> Option<QueuedOperation> {
        self.inner.state().buffer.get(&queue_key(kind, id)).cloned()
    }

    pub fn timer_armed(&self) -> bool {
        self.inner.state().timer.is_some()
    }
}

impl ChangeSink for SyncQueue {
    fn accept(&self, event: ChangeEvent) {
        self.enqueue(event.kind, event.id, event.operation, event.payload);
    }
}
