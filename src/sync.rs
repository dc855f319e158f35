//! The per-entry sync action run by the queue and the forward rebuild.
//!
//! Every write happens under the type-scoped [`CollectionLock`]. A `save`
//! re-reads the document from the SoR instead of trusting the event payload,
//! so whatever the mirror receives is the SoR state at flush time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::MirrorError;
use crate::lock::{CollectionLock, LockSettings};
use crate::mirror::{MirrorStore, WriteReport};
use crate::models::{
    AnswerRecord, AssistRelationRecord, ChatSessionRecord, EntityKind, Operation, OwnerRecord,
    QueuedOperation,
};
use crate::store::{decode, RecordStore};

/// What a sync action did with one queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Mirrored(WriteReport),
    /// The document was deleted before the flush reached it.
    Vanished,
    /// Deletes are not propagated to the mirror.
    DeleteIgnored,
}

/// Executes one buffered operation. Implemented by [`MirrorSync`]; tests plug
/// in recorders.
#[async_trait]
pub trait SyncAction: Send + Sync {
    async fn execute(&self, op: &QueuedOperation) -> Result<SyncOutcome>;
}

pub struct MirrorSync {
    store: Arc<dyn RecordStore>,
    mirror: MirrorStore,
    lock_dir: PathBuf,
    lock: LockSettings,
}

impl MirrorSync {
    pub fn new(
        store: Arc<dyn RecordStore>,
        mirror: MirrorStore,
        lock_dir: impl Into<PathBuf>,
        lock: LockSettings,
    ) -> Self {
        Self {
            store,
            mirror,
            lock_dir: lock_dir.into(),
            lock,
        }
    }

    pub fn mirror(&self) -> &MirrorStore {
        &self.mirror
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    async fn lock(&self, kind: EntityKind) -> Result<CollectionLock, MirrorError> {
        CollectionLock::for_kind(&self.lock_dir, kind, &self.lock).await
    }

    /// Lock, re-fetch `id` from the SoR, and mirror it.
    pub async fn sync_one(&self, kind: EntityKind, id: &str) -> Result<SyncOutcome> {
        let _guard = self.lock(kind).await?;

        let Some(document) = self.store.fetch(kind, id).await? else {
            debug!(%kind, id, "document gone before flush, skipping");
            return Ok(SyncOutcome::Vanished);
        };

        let report = self.write_document(kind, id, document)?;
        Ok(SyncOutcome::Mirrored(report))
    }

    fn write_document(
        &self,
        kind: EntityKind,
        id: &str,
        document: Value,
    ) -> Result<WriteReport, MirrorError> {
        match kind {
            EntityKind::Owner => self.mirror.write_owner(&decode::<OwnerRecord>(id, document)?),
            EntityKind::Answer => self.mirror.write_answer(&decode::<AnswerRecord>(id, document)?),
            EntityKind::AssistRelation => self
                .mirror
                .write_relation(&decode::<AssistRelationRecord>(id, document)?),
            EntityKind::ChatSession => self
                .mirror
                .write_session(&decode::<ChatSessionRecord>(id, document)?),
        }
    }
}

#[async_trait]
impl SyncAction for MirrorSync {
    async fn execute(&self, op: &QueuedOperation) -> Result<SyncOutcome> {
        match op.operation {
            Operation::Save => self.sync_one(op.kind, &op.id).await,
            Operation::Delete => {
                info!(
                    kind = %op.kind,
                    id = %op.id,
                    "delete not propagated to mirror; entry left in place"
                );
                Ok(SyncOutcome::DeleteIgnored)
            }
        }
    }
}
