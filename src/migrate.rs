use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::models::EntityKind;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;

    println!("System of record initialized.");
    for kind in EntityKind::ALL {
        println!("  table {:<18} ok", kind.table());
    }

    Ok(())
}

/// Create one table per tracked kind. Idempotent.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    for kind in EntityKind::ALL {
        let table = kind.table();
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                body_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#
        ))
        .execute(pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_owner ON {table}(owner_id)"
        ))
        .execute(pool)
        .await?;
    }

    Ok(())
}
