//! In-memory [`RecordStore`] implementation for tests and embedding.
//!
//! Documents live in a `BTreeMap` per kind behind `std::sync::RwLock`, so
//! listings come back ordered by id just like the SQLite backend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::error::MirrorError;
use crate::models::{ChangeEvent, EntityKind, UpsertOutcome};

use super::{HookTable, MutationHook, RecordStore};

pub struct InMemoryStore {
    collections: RwLock<HashMap<EntityKind, BTreeMap<String, Value>>>,
    missing: HashSet<EntityKind>,
    hooks: HookTable,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            missing: HashSet::new(),
            hooks: HookTable::default(),
        }
    }

    /// A store lacking the collections for `kinds`; every operation on them
    /// fails with [`MirrorError::CollectionUnavailable`].
    pub fn without_collections(kinds: impl IntoIterator<Item = EntityKind>) -> Self {
        Self {
            missing: kinds.into_iter().collect(),
            ..Self::new()
        }
    }

    pub fn hook_count(&self, kind: EntityKind) -> usize {
        self.hooks.hook_count(kind)
    }

    /// Number of stored documents of `kind`.
    pub fn len(&self, kind: EntityKind) -> usize {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        collections.get(&kind).map_or(0, BTreeMap::len)
    }

    fn check(&self, kind: EntityKind) -> Result<()> {
        if self.missing.contains(&kind) {
            return Err(MirrorError::CollectionUnavailable(kind).into());
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn fetch(&self, kind: EntityKind, id: &str) -> Result<Option<Value>> {
        self.check(kind)?;
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(collections.get(&kind).and_then(|docs| docs.get(id)).cloned())
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>> {
        self.check(kind)?;
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(collections
            .get(&kind)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_ids(&self, kind: EntityKind) -> Result<Vec<String>> {
        self.check(kind)?;
        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(collections
            .get(&kind)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert(&self, kind: EntityKind, id: &str, document: &Value) -> Result<UpsertOutcome> {
        self.check(kind)?;
        let outcome = {
            let mut collections = self
                .collections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let docs = collections.entry(kind).or_default();
            match docs.insert(id.to_string(), document.clone()) {
                None => UpsertOutcome::Created,
                Some(previous) if previous == *document => UpsertOutcome::Unchanged,
                Some(_) => UpsertOutcome::Updated,
            }
        };

        // Hooks fire after the write lock is released, as after a commit.
        self.hooks.emit(ChangeEvent::save(kind, id, document.clone()));
        Ok(outcome)
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool> {
        self.check(kind)?;
        let removed = {
            let mut collections = self
                .collections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            collections
                .get_mut(&kind)
                .and_then(|docs| docs.remove(id))
                .is_some()
        };

        if removed {
            self.hooks.emit(ChangeEvent::delete(kind, id));
        }
        Ok(removed)
    }

    async fn attach_hook(&self, kind: EntityKind, hook: Arc<dyn MutationHook>) -> Result<()> {
        self.check(kind)?;
        self.hooks.attach(kind, hook);
        Ok(())
    }
}
