//! Mirror → SoR rebuild.
//!
//! Walks the mirror layout, rebuilds typed ids from directory names, and
//! upserts into the SoR. Owners with only some of their files are restored
//! from whatever exists, with one warning naming what was missing. Existing
//! SoR sub-documents are kept when the mirror has no file for them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::error::MirrorError;
use crate::migrate;
use crate::mirror::{relation_key, MirrorStore};
use crate::models::{
    AnswerId, AnswerRecord, AssistRelationRecord, ChatSessionRecord, EntityKind, OwnerId,
    OwnerProfile, OwnerRecord, SessionId, UpsertOutcome,
};
use crate::progress::{should_report, Direction, RebuildProgressEvent, RebuildProgressReporter};
use crate::store::sqlite::SqliteStore;
use crate::store::{self, RecordStore};

use super::{KindStats, RebuildSummary};

const REPORT_EVERY: u64 = 100;

enum OwnerRestore {
    Skipped,
    Restored {
        outcome: UpsertOutcome,
        missing: Vec<&'static str>,
    },
}

pub async fn reverse_rebuild(
    store: &dyn RecordStore,
    mirror: &MirrorStore,
    reporter: &dyn RebuildProgressReporter,
) -> Result<RebuildSummary> {
    if !mirror.root().is_dir() {
        anyhow::bail!("mirror root {} is not a directory", mirror.root().display());
    }

    let mut summary = RebuildSummary::new(Direction::Reverse);
    for kind in EntityKind::ALL {
        reporter.report(RebuildProgressEvent::Scanning {
            direction: Direction::Reverse,
            kind,
        });
        let stats = summary.stats_mut(kind);
        match kind {
            EntityKind::Owner => restore_owners(store, mirror, stats, reporter).await?,
            EntityKind::Answer => restore_answers(store, mirror, stats, reporter).await?,
            EntityKind::AssistRelation => {
                restore_relations(store, mirror, stats, reporter).await?
            }
            EntityKind::ChatSession => restore_sessions(store, mirror, stats, reporter).await?,
        }
    }

    let totals = summary.totals();
    info!(
        processed = totals.processed,
        errors = totals.errors,
        warnings = totals.warnings,
        "reverse rebuild finished"
    );
    Ok(summary)
}

fn progress(
    reporter: &dyn RebuildProgressReporter,
    kind: EntityKind,
    index: usize,
    total: u64,
) {
    let n = index as u64 + 1;
    if should_report(n, total, REPORT_EVERY) {
        reporter.report(RebuildProgressEvent::Copying {
            direction: Direction::Reverse,
            kind,
            n,
            total,
        });
    }
}

fn record_failure(stats: &mut KindStats, kind: EntityKind, item: &str, error: &anyhow::Error) {
    stats.errors += 1;
    warn!(%kind, item, error = %format!("{:#}", error), "failed to restore record");
}

/// Decode a mirror file, forcing its id field to the id taken from the path.
fn decode_file<T: DeserializeOwned>(
    path: &Path,
    mut value: Value,
    id_field: &str,
    id: &str,
) -> Result<T, MirrorError> {
    if let Some(object) = value.as_object_mut() {
        object.insert(id_field.to_string(), Value::String(id.to_string()));
    }
    serde_json::from_value(value).map_err(|source| MirrorError::MalformedFile {
        path: path.to_path_buf(),
        source,
    })
}

// ============ Owners ============

async fn restore_owners(
    store: &dyn RecordStore,
    mirror: &MirrorStore,
    stats: &mut KindStats,
    reporter: &dyn RebuildProgressReporter,
) -> Result<()> {
    let names = mirror.owner_dir_names()?;
    let total = names.len() as u64;
    stats.total = total;

    for (i, name) in names.iter().enumerate() {
        match restore_owner(store, mirror, name).await {
            Ok(OwnerRestore::Skipped) => {
                stats.skipped += 1;
                stats.warnings += 1;
                warn!(owner = %name, "no recognised owner files, skipped");
            }
            Ok(OwnerRestore::Restored { outcome, missing }) => {
                stats.record_upsert(outcome);
                if !missing.is_empty() {
                    stats.warnings += 1;
                    warn!(owner = %name, missing = %missing.join(", "), "owner restored without some files");
                }
            }
            Err(e) => record_failure(stats, EntityKind::Owner, name, &e),
        }
        progress(reporter, EntityKind::Owner, i, total);
    }
    Ok(())
}

async fn restore_owner(
    store: &dyn RecordStore,
    mirror: &MirrorStore,
    name: &str,
) -> Result<OwnerRestore> {
    let id = OwnerId::parse(name)?;
    let files = mirror.read_owner(&id)?;
    if files.is_empty() {
        return Ok(OwnerRestore::Skipped);
    }
    let missing = files.missing();

    let existing: Option<OwnerRecord> = store::get(store, id.as_str()).await?;

    let profile = match files.profile {
        Some(value) => {
            let path = mirror.owner_dir(&id).join(crate::mirror::PROFILE_FILE);
            decode_file::<OwnerProfile>(&path, value, "id", id.as_str())?
        }
        None => existing
            .as_ref()
            .map(|record| record.profile.clone())
            .unwrap_or_else(|| OwnerProfile::bare(id.clone())),
    };

    let mut companion = existing.map(|record| record.companion).unwrap_or_default();
    if files.role_card.is_some() {
        companion.role_card = files.role_card;
    }
    if files.stranger_sentiments.is_some() {
        companion.stranger_sentiments = files.stranger_sentiments;
    }
    if files.conversations_as_target.is_some() {
        companion.conversations_as_target = files.conversations_as_target;
    }
    if files.assistants_guidelines.is_some() {
        companion.assistants_guidelines = files.assistants_guidelines;
    }

    let outcome = store::save(store, &OwnerRecord { profile, companion }).await?;
    Ok(OwnerRestore::Restored { outcome, missing })
}

// ============ Answers and sessions ============

async fn restore_answers(
    store: &dyn RecordStore,
    mirror: &MirrorStore,
    stats: &mut KindStats,
    reporter: &dyn RebuildProgressReporter,
) -> Result<()> {
    let names = mirror.answer_dir_names()?;
    let total = names.len() as u64;
    stats.total = total;

    for (i, name) in names.iter().enumerate() {
        match restore_answer(store, mirror, name).await {
            Ok(outcome) => stats.record_upsert(outcome),
            Err(e) => record_failure(stats, EntityKind::Answer, name, &e),
        }
        progress(reporter, EntityKind::Answer, i, total);
    }
    Ok(())
}

async fn restore_sessions(
    store: &dyn RecordStore,
    mirror: &MirrorStore,
    stats: &mut KindStats,
    reporter: &dyn RebuildProgressReporter,
) -> Result<()> {
    let names = mirror.session_dir_names()?;
    let total = names.len() as u64;
    stats.total = total;

    for (i, name) in names.iter().enumerate() {
        match restore_session(store, mirror, name).await {
            Ok(outcome) => stats.record_upsert(outcome),
            Err(e) => record_failure(stats, EntityKind::ChatSession, name, &e),
        }
        progress(reporter, EntityKind::ChatSession, i, total);
    }
    Ok(())
}

async fn restore_answer(
    store: &dyn RecordStore,
    mirror: &MirrorStore,
    name: &str,
) -> Result<UpsertOutcome> {
    let id = AnswerId::parse(name)?;
    let record: AnswerRecord = read_snapshot(mirror, &mirror.answer_path(&id), "id", name)?;
    store::save(store, &record).await
}

async fn restore_session(
    store: &dyn RecordStore,
    mirror: &MirrorStore,
    name: &str,
) -> Result<UpsertOutcome> {
    let id = SessionId::parse(name)?;
    let record: ChatSessionRecord =
        read_snapshot(mirror, &mirror.session_path(&id), "sessionId", name)?;
    store::save(store, &record).await
}

fn read_snapshot<T: DeserializeOwned>(
    mirror: &MirrorStore,
    path: &Path,
    id_field: &str,
    id: &str,
) -> Result<T> {
    let value = mirror
        .read_file(path)?
        .ok_or_else(|| anyhow!("snapshot file {} is missing", path.display()))?;
    Ok(decode_file(path, value, id_field, id)?)
}

// ============ Relations ============

async fn restore_relations(
    store: &dyn RecordStore,
    mirror: &MirrorStore,
    stats: &mut KindStats,
    reporter: &dyn RebuildProgressReporter,
) -> Result<()> {
    let mut entries: Vec<(PathBuf, Value)> = Vec::new();
    for path in mirror.relation_files()? {
        match mirror.read_relations(&path) {
            Ok(list) => entries.extend(list.into_iter().map(|entry| (path.clone(), entry))),
            Err(e) => {
                let item = path.display().to_string();
                record_failure(stats, EntityKind::AssistRelation, &item, &anyhow::Error::from(e));
            }
        }
    }

    let total = entries.len() as u64;
    stats.total = total;

    // Files are visited in sorted owner order; the first copy of an id wins.
    let mut seen: HashSet<String> = HashSet::new();
    for (i, (path, entry)) in entries.into_iter().enumerate() {
        let id = relation_key(&entry).to_string();
        if !id.is_empty() && !seen.insert(id.clone()) {
            stats.skipped += 1;
            stats.warnings += 1;
            warn!(relation = %id, path = %path.display(), "duplicate relation in mirror, keeping the first copy");
            progress(reporter, EntityKind::AssistRelation, i, total);
            continue;
        }
        match restore_relation(store, &path, entry).await {
            Ok(outcome) => stats.record_upsert(outcome),
            Err(e) => {
                let item = path.display().to_string();
                record_failure(stats, EntityKind::AssistRelation, &item, &e);
            }
        }
        progress(reporter, EntityKind::AssistRelation, i, total);
    }
    Ok(())
}

async fn restore_relation(
    store: &dyn RecordStore,
    path: &Path,
    entry: Value,
) -> Result<UpsertOutcome> {
    let record: AssistRelationRecord =
        serde_json::from_value(entry).map_err(|source| MirrorError::MalformedFile {
            path: path.to_path_buf(),
            source,
        })?;
    store::save(store, &record).await
}

/// `afs-mirror reverse-rebuild`.
pub async fn run_reverse_rebuild(
    config: &Config,
    reporter: &dyn RebuildProgressReporter,
) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool)
        .await
        .context("Failed to prepare SoR schema")?;
    let store = SqliteStore::new(pool);
    let mirror = MirrorStore::new(&config.mirror.root);

    let summary = reverse_rebuild(&store, &mirror, reporter).await?;
    summary.print();
    Ok(())
}
