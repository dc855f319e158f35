//! Typed errors for the replication core.
//!
//! Tool and CLI boundaries work in [`anyhow`]; these variants exist so a
//! caller can tell a transient per-item failure (lock contention, a bad path
//! segment) apart from an I/O or store failure by downcasting.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::EntityKind;

/// Result alias for operations that only fail with [`MirrorError`].
pub type MirrorResult<T> = Result<T, MirrorError>;

#[derive(Debug, Error)]
pub enum MirrorError {
    /// Another holder owns the lock and it is not yet stale.
    #[error("lock '{scope}' is held by pid {pid} since {since}")]
    LockHeld {
        scope: String,
        pid: u32,
        since: String,
    },

    /// A string could not be used as a record identifier.
    #[error("invalid {what} '{value}': {reason}")]
    InvalidId {
        what: &'static str,
        value: String,
        reason: &'static str,
    },

    /// The store has no collection backing this entity kind.
    #[error("collection for {0} is not available")]
    CollectionUnavailable(EntityKind),

    /// A mirror file exists but does not hold the expected JSON shape.
    #[error("malformed mirror file {path}: {source}")]
    MalformedFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A stored document does not decode into its typed record.
    #[error("{kind} document '{id}' does not decode: {source}")]
    Decode {
        kind: EntityKind,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    /// The queue was created outside a tokio runtime.
    #[error("no tokio runtime available to drive the debounce timer")]
    NoRuntime,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MirrorError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Lock contention and malformed input are per-item problems; the batch
    /// carries on without them.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockHeld { .. }
                | Self::InvalidId { .. }
                | Self::MalformedFile { .. }
                | Self::Decode { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_held_is_transient() {
        let err = MirrorError::LockHeld {
            scope: "answer".into(),
            pid: 42,
            since: "2024-01-01T00:00:00Z".into(),
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("pid 42"));
    }

    #[test]
    fn io_is_not_transient() {
        let err = MirrorError::io(
            "/nope",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_transient());
    }
}
