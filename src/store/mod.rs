//! System-of-record abstraction.
//!
//! The [`RecordStore`] trait is the only surface the replication core needs
//! from the SoR: keyed document access per [`EntityKind`], plus post-mutation
//! hooks. Documents cross the trait as JSON; the typed helpers at the bottom
//! of this module ([`get`], [`list`], [`save`]) decode them into records.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`sqlite::SqliteStore`] | the deployed SoR |
//! | [`memory::InMemoryStore`] | tests and embedding |

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::error::MirrorError;
use crate::models::{ChangeEvent, EntityKind, Record, UpsertOutcome};

/// Callback fired after a committed SoR mutation.
///
/// Runs inline on the mutation path, so implementations must not block or
/// perform I/O.
pub trait MutationHook: Send + Sync {
    fn after_mutation(&self, event: ChangeEvent);
}

/// Abstract system of record.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`fetch`](RecordStore::fetch) | current document by id |
/// | [`list`](RecordStore::list) | every document of a kind, ordered by id |
/// | [`upsert`](RecordStore::upsert) | insert or replace, fires save hooks |
/// | [`delete`](RecordStore::delete) | remove, fires delete hooks |
/// | [`attach_hook`](RecordStore::attach_hook) | subscribe to mutations of a kind |
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn fetch(&self, kind: EntityKind, id: &str) -> Result<Option<Value>>;

    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>>;

    async fn list_ids(&self, kind: EntityKind) -> Result<Vec<String>>;

    async fn upsert(&self, kind: EntityKind, id: &str, document: &Value) -> Result<UpsertOutcome>;

    /// Returns `false` when nothing was stored under `id`.
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool>;

    /// Fails when the store has no collection for `kind`.
    async fn attach_hook(&self, kind: EntityKind, hook: Arc<dyn MutationHook>) -> Result<()>;
}

/// Hook table shared by the backends.
#[derive(Default)]
pub struct HookTable {
    hooks: RwLock<HashMap<EntityKind, Vec<Arc<dyn MutationHook>>>>,
}

impl HookTable {
    pub fn attach(&self, kind: EntityKind, hook: Arc<dyn MutationHook>) {
        let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        hooks.entry(kind).or_default().push(hook);
    }

    pub fn hook_count(&self, kind: EntityKind) -> usize {
        let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner);
        hooks.get(&kind).map_or(0, Vec::len)
    }

    pub fn emit(&self, event: ChangeEvent) {
        // Clone the subscriber list so a hook can never deadlock the table.
        let subscribers: Vec<Arc<dyn MutationHook>> = {
            let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner);
            hooks.get(&event.kind).cloned().unwrap_or_default()
        };
        for hook in subscribers {
            hook.after_mutation(event.clone());
        }
    }
}

/// Read the identifying field of a document.
pub fn document_id(kind: EntityKind, document: &Value) -> Option<&str> {
    document.get(kind.id_field()).and_then(Value::as_str)
}

/// Read the field naming the owning user of a document.
pub fn document_owner(kind: EntityKind, document: &Value) -> Option<&str> {
    document.get(kind.owner_field()).and_then(Value::as_str)
}

/// Decode a SoR document into its typed record.
pub fn decode<R: Record>(id: &str, document: Value) -> Result<R, MirrorError> {
    serde_json::from_value(document).map_err(|source| MirrorError::Decode {
        kind: R::KIND,
        id: id.to_string(),
        source,
    })
}

/// Fetch and decode one record.
pub async fn get<R: Record>(store: &dyn RecordStore, id: &str) -> Result<Option<R>> {
    match store.fetch(R::KIND, id).await? {
        Some(document) => Ok(Some(decode(id, document)?)),
        None => Ok(None),
    }
}

/// Fetch and decode every record of a kind.
pub async fn list<R: Record>(store: &dyn RecordStore) -> Result<Vec<R>> {
    store
        .list(R::KIND)
        .await?
        .into_iter()
        .map(|document| {
            let id = document_id(R::KIND, &document)
                .unwrap_or_default()
                .to_string();
            Ok(decode(&id, document)?)
        })
        .collect()
}

pub async fn save<R: Record>(store: &dyn RecordStore, record: &R) -> Result<UpsertOutcome> {
    let document = serde_json::to_value(record)?;
    store.upsert(R::KIND, record.record_id(), &document).await
}
