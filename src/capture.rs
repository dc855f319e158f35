//! Change capture: attaches post-mutation hooks to the tracked entity kinds
//! and forwards each event to a late-bound [`ChangeSink`].
//!
//! The sink is injected (constructor or [`ChangeCaptureRegistry::bind_sink`])
//! and can be swapped at runtime. While no sink is bound, events are dropped.

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, trace, warn};

use crate::models::{ChangeEvent, EntityKind, Operation};
use crate::store::{MutationHook, RecordStore};

/// Receives captured changes. Called inline on the mutation path, so it must
/// not block.
pub trait ChangeSink: Send + Sync {
    fn accept(&self, event: ChangeEvent);
}

#[derive(Default)]
struct SinkSlot {
    sink: RwLock<Option<Arc<dyn ChangeSink>>>,
}

impl SinkSlot {
    fn current(&self) -> Option<Arc<dyn ChangeSink>> {
        self.sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, sink: Option<Arc<dyn ChangeSink>>) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = sink;
    }
}

struct CaptureHook {
    kind: EntityKind,
    slot: Arc<SinkSlot>,
}

impl MutationHook for CaptureHook {
    fn after_mutation(&self, event: ChangeEvent) {
        let Some(sink) = self.slot.current() else {
            trace!(kind = %self.kind, id = %event.id, "no sink bound, change dropped");
            return;
        };
        // Deletes carry the id only.
        let event = match event.operation {
            Operation::Save => event,
            Operation::Delete => ChangeEvent::delete(event.kind, event.id),
        };
        sink.accept(event);
    }
}

/// Result of [`ChangeCaptureRegistry::register_all`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistrationSummary {
    pub attached: Vec<EntityKind>,
    pub already_hooked: Vec<EntityKind>,
    pub failed: Vec<(EntityKind, String)>,
}

pub struct ChangeCaptureRegistry {
    store: Arc<dyn RecordStore>,
    slot: Arc<SinkSlot>,
    hooked: tokio::sync::Mutex<BTreeSet<EntityKind>>,
}

impl ChangeCaptureRegistry {
    /// A registry with no sink bound yet.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            slot: Arc::new(SinkSlot::default()),
            hooked: tokio::sync::Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_sink(store: Arc<dyn RecordStore>, sink: Arc<dyn ChangeSink>) -> Self {
        let registry = Self::new(store);
        registry.bind_sink(sink);
        registry
    }

    /// Bind or replace the sink. Hooks already attached pick it up at once.
    pub fn bind_sink(&self, sink: Arc<dyn ChangeSink>) {
        self.slot.replace(Some(sink));
    }

    pub fn unbind_sink(&self) {
        self.slot.replace(None);
    }

    pub fn has_sink(&self) -> bool {
        self.slot.current().is_some()
    }

    /// Attach the hook for one kind. Returns `Ok(false)` when it was already
    /// attached.
    pub async fn register(&self, kind: EntityKind) -> anyhow::Result<bool> {
        let mut hooked = self.hooked.lock().await;
        if hooked.contains(&kind) {
            debug!(%kind, "already hooked");
            return Ok(false);
        }
        let hook = Arc::new(CaptureHook {
            kind,
            slot: Arc::clone(&self.slot),
        });
        self.store.attach_hook(kind, hook).await?;
        hooked.insert(kind);
        Ok(true)
    }

    /// Attach hooks for every tracked kind. A failure on one kind is logged
    /// and does not stop the others.
    pub async fn register_all(&self) -> RegistrationSummary {
        let mut summary = RegistrationSummary::default();
        for kind in EntityKind::ALL {
            match self.register(kind).await {
                Ok(true) => summary.attached.push(kind),
                Ok(false) => summary.already_hooked.push(kind),
                Err(e) => {
                    warn!(%kind, error = %format!("{:#}", e), "failed to attach change hook");
                    summary.failed.push((kind, e.to_string()));
                }
            }
        }
        info!(
            attached = summary.attached.len(),
            already_hooked = summary.already_hooked.len(),
            failed = summary.failed.len(),
            "change capture registered"
        );
        summary
    }

    pub async fn hooked_kinds(&self) -> Vec<EntityKind> {
        self.hooked.lock().await.iter().copied().collect()
    }
}
