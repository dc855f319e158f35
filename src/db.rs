use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let url = &config.store.url;

    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid store.url: {}", url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    // Ensure parent directory exists
    let filename = options.get_filename();
    if !filename.as_os_str().is_empty() && filename.as_os_str() != ":memory:" {
        if let Some(parent) = filename.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.store.max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to system of record at {}", url))?;

    Ok(pool)
}

/// Open an existing SoR without creating the file or touching its schema.
pub async fn connect_existing(config: &Config) -> Result<SqlitePool> {
    let url = &config.store.url;

    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid store.url: {}", url))?
        .create_if_missing(false);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.store.max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open system of record at {}", url))?;

    Ok(pool)
}
