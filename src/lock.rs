//! Type-scoped filesystem lock.
//!
//! Every mirror write for an entity kind happens while holding
//! `<lock_dir>/sync-operation-<kind>.lock`. The lock file is created with
//! `create_new`, so acquisition is atomic across processes sharing the lock
//! directory. A lock older than the staleness window is archived next to the
//! live file and reclaimed.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MirrorError, MirrorResult};
use crate::models::EntityKind;

/// Acquisition policy.
#[derive(Debug, Clone)]
pub struct LockSettings {
    /// A lock older than this is abandoned and may be reclaimed.
    pub stale_after: Duration,
    /// Extra attempts after the first one finds the lock held.
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_millis(5000),
            retries: 1,
            retry_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    created_at_rfc3339: String,
    scope: String,
}

enum Holder {
    Gone,
    Stale(&'static str),
    Live { pid: u32, since: String },
}

/// A held lock. Released on drop.
#[derive(Debug)]
pub struct CollectionLock {
    path: PathBuf,
    scope: String,
    released: bool,
}

impl CollectionLock {
    /// Lock the mirror for one entity kind.
    pub async fn for_kind(
        lock_dir: &Path,
        kind: EntityKind,
        settings: &LockSettings,
    ) -> MirrorResult<Self> {
        Self::acquire(lock_dir, kind.as_str(), settings).await
    }

    pub async fn acquire(
        lock_dir: &Path,
        scope: &str,
        settings: &LockSettings,
    ) -> MirrorResult<Self> {
        fs::create_dir_all(lock_dir).map_err(|e| MirrorError::io(lock_dir, e))?;
        let path = lock_path(lock_dir, scope);
        let mut retries_left = settings.retries;

        loop {
            match try_create(&path, scope) {
                Ok(()) => {
                    debug!(scope, path = %path.display(), "lock acquired");
                    return Ok(Self {
                        path,
                        scope: scope.to_string(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(MirrorError::io(&path, e)),
            }

            match inspect(&path, settings.stale_after) {
                Holder::Gone => continue,
                Holder::Stale(reason) => {
                    archive(&path, reason)?;
                    warn!(scope, reason, "reclaimed abandoned lock");
                }
                Holder::Live { pid, since } => {
                    if retries_left == 0 {
                        return Err(MirrorError::LockHeld {
                            scope: scope.to_string(),
                            pid,
                            since,
                        });
                    }
                    retries_left -= 1;
                    debug!(scope, pid, "lock busy, retrying");
                    tokio::time::sleep(settings.retry_delay).await;
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn release(mut self) -> MirrorResult<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> MirrorResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MirrorError::io(&self.path, e)),
        }
    }
}

impl Drop for CollectionLock {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(scope = %self.scope, error = %e, "failed to release lock");
        }
    }
}

pub fn lock_path(lock_dir: &Path, scope: &str) -> PathBuf {
    lock_dir.join(format!("sync-operation-{}.lock", scope))
}

fn try_create(path: &Path, scope: &str) -> std::io::Result<()> {
    let info = LockInfo {
        pid: std::process::id(),
        created_at_rfc3339: Utc::now().to_rfc3339(),
        scope: scope.to_string(),
    };
    let mut file = OpenOptions::new().create_new(true).write(true).open(path)?;
    let body = serde_json::to_string_pretty(&info).map_err(std::io::Error::other)?;
    file.write_all(body.as_bytes())?;
    file.sync_all()
}

fn inspect(path: &Path, stale_after: Duration) -> Holder {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Holder::Gone,
        // Unreadable but present: treat as held and let the retry budget decide.
        Err(_) => {
            return Holder::Live {
                pid: 0,
                since: "unknown".to_string(),
            }
        }
    };

    match serde_json::from_str::<LockInfo>(&contents) {
        Ok(info) => {
            let stale = DateTime::parse_from_rfc3339(&info.created_at_rfc3339)
                .map(|created| {
                    let age = Utc::now().signed_duration_since(created);
                    age.to_std().map_or(false, |age| age > stale_after)
                })
                .unwrap_or(true);
            if stale {
                Holder::Stale("stale")
            } else {
                Holder::Live {
                    pid: info.pid,
                    since: info.created_at_rfc3339,
                }
            }
        }
        // A holder may still be writing its metadata; judge by mtime.
        Err(_) => {
            let old = fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .map_or(false, |age| age > stale_after);
            if old {
                Holder::Stale("corrupt")
            } else {
                Holder::Live {
                    pid: 0,
                    since: "unknown".to_string(),
                }
            }
        }
    }
}

fn archive(path: &Path, reason: &str) -> MirrorResult<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let archived = path.with_file_name(format!(
        "{}.{}.{}.json",
        file_name,
        reason,
        Utc::now().timestamp_millis()
    ));
    match fs::rename(path, &archived) {
        Ok(()) => Ok(()),
        // Another contender archived it first.
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MirrorError::io(path, e)),
    }
}
