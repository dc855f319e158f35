//! TOML configuration with environment overrides.
//!
//! Every knob has a default, so a missing config file is not an error.
//! `AFS_DATABASE_URL` and `AFS_MIRROR_ROOT` are applied after parsing.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lock::LockSettings;

pub const ENV_DATABASE_URL: &str = "AFS_DATABASE_URL";
pub const ENV_MIRROR_ROOT: &str = "AFS_MIRROR_ROOT";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_store_url() -> String {
    "sqlite://./data/afs.sqlite".to_string()
}
fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct MirrorConfig {
    #[serde(default = "default_mirror_root")]
    pub root: PathBuf,
    /// Directory for lock files. Defaults to `.locks` next to the mirror root.
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            root: default_mirror_root(),
            lock_dir: None,
        }
    }
}

fn default_mirror_root() -> PathBuf {
    PathBuf::from("./storage/userdata")
}

impl MirrorConfig {
    pub fn lock_dir(&self) -> PathBuf {
        match &self.lock_dir {
            Some(dir) => dir.clone(),
            None => self
                .root
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .join(".locks"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_lock_stale_ms")]
    pub lock_stale_ms: u64,
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "default_lock_retry_delay_ms")]
    pub lock_retry_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            lock_stale_ms: default_lock_stale_ms(),
            lock_retries: default_lock_retries(),
            lock_retry_delay_ms: default_lock_retry_delay_ms(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    100
}
fn default_lock_stale_ms() -> u64 {
    5000
}
fn default_lock_retries() -> u32 {
    1
}
fn default_lock_retry_delay_ms() -> u64 {
    100
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            stale_after: Duration::from_millis(self.lock_stale_ms),
            retries: self.lock_retries,
            retry_delay: Duration::from_millis(self.lock_retry_delay_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    #[serde(default = "default_preview_limit")]
    pub preview_limit: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            preview_limit: default_preview_limit(),
        }
    }
}

fn default_preview_limit() -> usize {
    5
}

impl Config {
    /// Apply environment overrides through `lookup`, so tests need not touch
    /// the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_DATABASE_URL).filter(|v| !v.trim().is_empty()) {
            self.store.url = url;
        }
        if let Some(root) = lookup(ENV_MIRROR_ROOT).filter(|v| !v.trim().is_empty()) {
            self.mirror.root = PathBuf::from(root);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.url.trim().is_empty() {
            anyhow::bail!("store.url must not be empty");
        }
        if self.store.max_connections == 0 {
            anyhow::bail!("store.max_connections must be > 0");
        }
        if self.mirror.root.as_os_str().is_empty() {
            anyhow::bail!("mirror.root must not be empty");
        }
        if self.sync.debounce_ms == 0 {
            anyhow::bail!("sync.debounce_ms must be > 0");
        }
        if self.sync.lock_stale_ms <= self.sync.lock_retry_delay_ms {
            anyhow::bail!(
                "sync.lock_stale_ms ({}) must be greater than sync.lock_retry_delay_ms ({})",
                self.sync.lock_stale_ms,
                self.sync.lock_retry_delay_ms
            );
        }
        if self.audit.preview_limit == 0 {
            anyhow::bail!("audit.preview_limit must be >= 1");
        }
        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        parse_config(&content)?
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };

    config.apply_env(|key| std::env::var(key).ok());
    config.validate()?;

    Ok(config)
}
