//! SoR → mirror rebuild.
//!
//! Walks every id of every tracked kind and runs the same lock, re-fetch,
//! and write path the queue uses, so a rebuild can run next to a live
//! service. Running it twice against an unchanged SoR leaves the mirror
//! byte-identical.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::mirror::MirrorStore;
use crate::models::EntityKind;
use crate::progress::{should_report, Direction, RebuildProgressEvent, RebuildProgressReporter};
use crate::store::sqlite::SqliteStore;
use crate::store::RecordStore;
use crate::sync::{MirrorSync, SyncOutcome};

use super::RebuildSummary;

const REPORT_EVERY: u64 = 100;

pub async fn forward_rebuild(
    store: &dyn RecordStore,
    sync: &MirrorSync,
    reporter: &dyn RebuildProgressReporter,
) -> Result<RebuildSummary> {
    sync.mirror()
        .ensure_root()
        .context("Failed to create mirror root")?;

    let mut summary = RebuildSummary::new(Direction::Forward);

    for kind in EntityKind::ALL {
        reporter.report(RebuildProgressEvent::Scanning {
            direction: Direction::Forward,
            kind,
        });
        let ids = store
            .list_ids(kind)
            .await
            .with_context(|| format!("Failed to list {} records", kind))?;

        let total = ids.len() as u64;
        let stats = summary.stats_mut(kind);
        stats.total = total;

        for (i, id) in ids.iter().enumerate() {
            match sync.sync_one(kind, id).await {
                Ok(SyncOutcome::Vanished) => stats.skipped += 1,
                Ok(_) => stats.processed += 1,
                Err(e) => {
                    stats.errors += 1;
                    warn!(%kind, id = %id, error = %format!("{:#}", e), "failed to mirror record");
                }
            }

            let n = i as u64 + 1;
            if should_report(n, total, REPORT_EVERY) {
                reporter.report(RebuildProgressEvent::Copying {
                    direction: Direction::Forward,
                    kind,
                    n,
                    total,
                });
            }
        }
    }

    summary.digest = Some(sync.mirror().tree_digest()?);
    let totals = summary.totals();
    info!(
        processed = totals.processed,
        errors = totals.errors,
        "forward rebuild finished"
    );
    Ok(summary)
}

/// `afs-mirror forward-rebuild`.
pub async fn run_forward_rebuild(
    config: &Config,
    reporter: &dyn RebuildProgressReporter,
) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool)
        .await
        .context("Failed to prepare SoR schema")?;
    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::new(pool));
    let sync = MirrorSync::new(
        Arc::clone(&store),
        MirrorStore::new(&config.mirror.root),
        config.mirror.lock_dir(),
        config.sync.lock_settings(),
    );

    let summary = forward_rebuild(store.as_ref(), &sync, reporter).await?;
    summary.print();
    Ok(())
}
