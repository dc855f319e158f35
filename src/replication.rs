//! Wiring for a running service: sync action, queue, and capture registry.
//!
//! ```text
//! RecordStore ──hook──▶ ChangeCaptureRegistry ──sink──▶ SyncQueue ──flush──▶ MirrorSync
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::capture::{ChangeCaptureRegistry, ChangeSink, RegistrationSummary};
use crate::config::Config;
use crate::mirror::MirrorStore;
use crate::queue::{FlushSummary, SyncQueue};
use crate::store::RecordStore;
use crate::sync::MirrorSync;

pub struct Replication {
    queue: SyncQueue,
    registry: ChangeCaptureRegistry,
    registration: RegistrationSummary,
}

impl Replication {
    /// Build the pipeline for `store` and attach hooks. Must run inside a
    /// tokio runtime.
    pub async fn start(store: Arc<dyn RecordStore>, config: &Config) -> Result<Self> {
        let mirror = MirrorStore::new(&config.mirror.root);
        mirror
            .ensure_root()
            .with_context(|| format!("Failed to create mirror root: {}", mirror.root().display()))?;

        let sync = Arc::new(MirrorSync::new(
            Arc::clone(&store),
            mirror,
            config.mirror.lock_dir(),
            config.sync.lock_settings(),
        ));
        let queue = SyncQueue::new(sync, config.sync.debounce())?;

        let sink: Arc<dyn ChangeSink> = Arc::new(queue.clone());
        let registry = ChangeCaptureRegistry::with_sink(store, sink);
        let registration = registry.register_all().await;

        info!(
            root = %config.mirror.root.display(),
            debounce_ms = config.sync.debounce_ms,
            "replication started"
        );

        Ok(Self {
            queue,
            registry,
            registration,
        })
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn registry(&self) -> &ChangeCaptureRegistry {
        &self.registry
    }

    pub fn registration(&self) -> &RegistrationSummary {
        &self.registration
    }

    /// Stop capturing and flush what is still buffered.
    pub async fn shutdown(self) -> FlushSummary {
        self.registry.unbind_sink();
        let summary = self.queue.shutdown().await;
        info!(
            attempted = summary.attempted,
            failed = summary.failed,
            "replication stopped"
        );
        summary
    }
}
