//! SQLite-backed [`RecordStore`] implementation.
//!
//! One table per [`EntityKind`] (see [`crate::migrate::ensure_schema`]), each
//! row holding the canonical JSON body plus the owning user id for indexed
//! lookups. Hooks fire after the transaction commits.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::error::MirrorError;
use crate::models::{ChangeEvent, EntityKind, UpsertOutcome};

use super::{document_owner, HookTable, MutationHook, RecordStore};

pub struct SqliteStore {
    pool: SqlitePool,
    hooks: HookTable,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            hooks: HookTable::default(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn table_exists(&self, kind: EntityKind) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?",
        )
        .bind(kind.table())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

fn parse_body(kind: EntityKind, id: &str, body: &str) -> Result<Value> {
    serde_json::from_str(body).map_err(|source| {
        MirrorError::Decode {
            kind,
            id: id.to_string(),
            source,
        }
        .into()
    })
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn fetch(&self, kind: EntityKind, id: &str) -> Result<Option<Value>> {
        let row = sqlx::query(&format!(
            "SELECT body_json FROM {} WHERE id = ?",
            kind.table()
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let body: String = row.get("body_json");
                parse_body(kind, id, &body).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>> {
        let rows = sqlx::query(&format!(
            "SELECT id, body_json FROM {} ORDER BY id",
            kind.table()
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let body: String = row.get("body_json");
                parse_body(kind, &id, &body)
            })
            .collect()
    }

    async fn list_ids(&self, kind: EntityKind) -> Result<Vec<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar(&format!("SELECT id FROM {} ORDER BY id", kind.table()))
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    async fn upsert(&self, kind: EntityKind, id: &str, document: &Value) -> Result<UpsertOutcome> {
        let body = serde_json::to_string(document)?;
        let owner_id = document_owner(kind, document).unwrap_or_default();
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        let existing: Option<String> = sqlx::query_scalar(&format!(
            "SELECT body_json FROM {} WHERE id = ?",
            kind.table()
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing.as_deref() {
            None => UpsertOutcome::Created,
            Some(previous) if previous == body => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
        };

        if outcome != UpsertOutcome::Unchanged {
            sqlx::query(&format!(
                r#"
                INSERT INTO {} (id, owner_id, body_json, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    owner_id = excluded.owner_id,
                    body_json = excluded.body_json,
                    updated_at = excluded.updated_at
                "#,
                kind.table()
            ))
            .bind(id)
            .bind(owner_id)
            .bind(&body)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.hooks.emit(ChangeEvent::save(kind, id, document.clone()));
        Ok(outcome)
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", kind.table()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected() > 0;
        if removed {
            self.hooks.emit(ChangeEvent::delete(kind, id));
        }
        Ok(removed)
    }

    async fn attach_hook(&self, kind: EntityKind, hook: Arc<dyn MutationHook>) -> Result<()> {
        if !self.table_exists(kind).await? {
            return Err(MirrorError::CollectionUnavailable(kind).into());
        }
        self.hooks.attach(kind, hook);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::ensure_schema;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    struct Noop;

    impl MutationHook for Noop {
        fn after_mutation(&self, _event: ChangeEvent) {}
    }

    async fn memory_pool() -> SqlitePool {
        // A single connection keeps every query on the same in-memory database.
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn upsert_fetch_delete() {
        let pool = memory_pool().await;
        ensure_schema(&pool).await.unwrap();
        let store = SqliteStore::new(pool);

        let doc = json!({"relationId": "r1", "targetId": "elder", "assistantId": "h"});
        assert_eq!(
            store
                .upsert(EntityKind::AssistRelation, "r1", &doc)
                .await
                .unwrap(),
            UpsertOutcome::Created
        );
        assert_eq!(
            store
                .upsert(EntityKind::AssistRelation, "r1", &doc)
                .await
                .unwrap(),
            UpsertOutcome::Unchanged
        );

        let fetched = store
            .fetch(EntityKind::AssistRelation, "r1")
            .await
            .unwrap();
        assert_eq!(fetched, Some(doc));

        let owner: String = sqlx::query_scalar("SELECT owner_id FROM assist_relations")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(owner, "elder");

        assert!(store.delete(EntityKind::AssistRelation, "r1").await.unwrap());
        assert!(store
            .fetch(EntityKind::AssistRelation, "r1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn attach_requires_table() {
        let pool = memory_pool().await;
        let store = SqliteStore::new(pool);
        assert!(store
            .attach_hook(EntityKind::Owner, Arc::new(Noop))
            .await
            .is_err());

        ensure_schema(store.pool()).await.unwrap();
        assert!(store
            .attach_hook(EntityKind::Owner, Arc::new(Noop))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let pool = memory_pool().await;
        ensure_schema(&pool).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        let store = SqliteStore::new(pool);
        assert!(store.list_ids(EntityKind::Answer).await.unwrap().is_empty());
    }
}
