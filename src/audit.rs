//! Read-only consistency audit between the SoR and the mirror.
//!
//! For each tracked kind the auditor collects the id set on both sides and
//! reports the symmetric difference plus a consistency percentage. No record
//! is written to either store: the SoR is opened without create and an
//! uninitialised schema is an error.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::warn;

use crate::config::Config;
use crate::db;
use crate::mirror::{
    relation_key, MirrorStore, ANSWERS_DIR, ANSWER_FILE, PROFILE_FILE, SESSIONS_DIR, SESSION_FILE,
};
use crate::models::EntityKind;
use crate::store::sqlite::SqliteStore;
use crate::store::RecordStore;

#[derive(Debug, Clone, Serialize)]
pub struct KindAudit {
    pub kind: EntityKind,
    pub sor_count: usize,
    pub mirror_count: usize,
    pub only_in_sor: Vec<String>,
    pub only_in_mirror: Vec<String>,
    pub consistency_percent: u32,
}

impl KindAudit {
    pub fn compare(
        kind: EntityKind,
        sor: &BTreeSet<String>,
        mirror: &BTreeSet<String>,
        mirror_count: usize,
    ) -> Self {
        Self {
            kind,
            sor_count: sor.len(),
            mirror_count,
            only_in_sor: sor.difference(mirror).cloned().collect(),
            only_in_mirror: mirror.difference(sor).cloned().collect(),
            consistency_percent: consistency_percent(sor, mirror),
        }
    }

    pub fn inconsistencies(&self) -> usize {
        self.only_in_sor.len() + self.only_in_mirror.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Consistent,
    ForwardRebuild,
    ReverseRebuild,
}

impl Recommendation {
    pub fn message(&self) -> &'static str {
        match self {
            Recommendation::Consistent => "SoR and mirror agree; nothing to do.",
            Recommendation::ForwardRebuild => {
                "The mirror is missing SoR records: run `afs-mirror forward-rebuild`."
            }
            Recommendation::ReverseRebuild => {
                "The SoR is missing mirrored records: run `afs-mirror reverse-rebuild`."
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditSummary {
    pub total_sor: usize,
    pub total_mirror: usize,
    pub total_inconsistencies: usize,
    pub average_consistency: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub kinds: Vec<KindAudit>,
    pub summary: AuditSummary,
    pub recommendation: Recommendation,
}

impl AuditReport {
    pub fn from_kinds(kinds: Vec<KindAudit>) -> Self {
        let total_sor = kinds.iter().map(|k| k.sor_count).sum();
        let total_mirror = kinds.iter().map(|k| k.mirror_count).sum();
        let total_inconsistencies = kinds.iter().map(KindAudit::inconsistencies).sum();
        let average_consistency = if kinds.is_empty() {
            100.0
        } else {
            let sum: u32 = kinds.iter().map(|k| k.consistency_percent).sum();
            (f64::from(sum) / kinds.len() as f64 * 100.0).round() / 100.0
        };

        let missing_in_mirror: usize = kinds.iter().map(|k| k.only_in_sor.len()).sum();
        let missing_in_sor: usize = kinds.iter().map(|k| k.only_in_mirror.len()).sum();
        let recommendation = if missing_in_mirror == 0 && missing_in_sor == 0 {
            Recommendation::Consistent
        } else if missing_in_sor > missing_in_mirror {
            Recommendation::ReverseRebuild
        } else {
            // Ties go forward: the SoR is authoritative.
            Recommendation::ForwardRebuild
        };

        Self {
            kinds,
            summary: AuditSummary {
                total_sor,
                total_mirror,
                total_inconsistencies,
                average_consistency,
            },
            recommendation,
        }
    }

    pub fn kind(&self, kind: EntityKind) -> Option<&KindAudit> {
        self.kinds.iter().find(|k| k.kind == kind)
    }

    pub fn is_consistent(&self) -> bool {
        self.recommendation == Recommendation::Consistent
    }
}

/// `|sor ∩ mirror| / |sor ∪ mirror| × 100`, rounded. 100 when both are empty,
/// never 100 when they differ.
pub fn consistency_percent(sor: &BTreeSet<String>, mirror: &BTreeSet<String>) -> u32 {
    let union = sor.union(mirror).count();
    if union == 0 {
        return 100;
    }
    let intersection = sor.intersection(mirror).count();
    if intersection == union {
        return 100;
    }
    let percent = (intersection as f64 / union as f64 * 100.0).round() as u32;
    percent.min(99)
}

/// Ids present in the mirror for `kind`, plus the raw entry count.
fn mirror_ids(mirror: &MirrorStore, kind: EntityKind) -> Result<(BTreeSet<String>, usize)> {
    let root = mirror.root();
    let ids: BTreeSet<String> = match kind {
        EntityKind::Owner => mirror
            .owner_dir_names()?
            .into_iter()
            .filter(|name| root.join(name).join(PROFILE_FILE).is_file())
            .collect(),
        EntityKind::Answer => mirror
            .answer_dir_names()?
            .into_iter()
            .filter(|name| root.join(ANSWERS_DIR).join(name).join(ANSWER_FILE).is_file())
            .collect(),
        EntityKind::ChatSession => mirror
            .session_dir_names()?
            .into_iter()
            .filter(|name| {
                root.join(SESSIONS_DIR)
                    .join(name)
                    .join(SESSION_FILE)
                    .is_file()
            })
            .collect(),
        EntityKind::AssistRelation => {
            let mut ids = BTreeSet::new();
            let mut entries = 0;
            for path in mirror.relation_files()? {
                match mirror.read_relations(&path) {
                    Ok(list) => {
                        entries += list.len();
                        ids.extend(
                            list.iter()
                                .map(relation_key)
                                .filter(|id| !id.is_empty())
                                .map(str::to_string),
                        );
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable relations file"),
                }
            }
            return Ok((ids, entries));
        }
    };
    let count = ids.len();
    Ok((ids, count))
}

pub async fn audit(store: &dyn RecordStore, mirror: &MirrorStore) -> Result<AuditReport> {
    let mut kinds = Vec::with_capacity(EntityKind::ALL.len());
    for kind in EntityKind::ALL {
        let sor: BTreeSet<String> = store.list_ids(kind).await?.into_iter().collect();
        let (mirrored, mirror_count) = mirror_ids(mirror, kind)?;
        kinds.push(KindAudit::compare(kind, &sor, &mirrored, mirror_count));
    }
    Ok(AuditReport::from_kinds(kinds))
}

fn write_preview(out: &mut String, label: &str, ids: &[String], limit: usize) {
    let _ = writeln!(out, "  {:<16}{}", label, ids.len());
    for id in ids.iter().take(limit) {
        let _ = writeln!(out, "    - {}", id);
    }
    if ids.len() > limit {
        let _ = writeln!(out, "    ... and {} more", ids.len() - limit);
    }
}

pub fn render_text(report: &AuditReport, preview_limit: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "AFS mirror consistency report");
    let _ = writeln!(out, "=============================");

    for kind in &report.kinds {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", kind.kind.label());
        let _ = writeln!(out, "  {:<16}{}", "SoR:", kind.sor_count);
        let _ = writeln!(out, "  {:<16}{}", "Mirror:", kind.mirror_count);
        write_preview(&mut out, "Only in SoR:", &kind.only_in_sor, preview_limit);
        write_preview(&mut out, "Only in mirror:", &kind.only_in_mirror, preview_limit);
        let _ = writeln!(out, "  {:<16}{}%", "Consistency:", kind.consistency_percent);
    }

    let summary = &report.summary;
    let _ = writeln!(out);
    let _ = writeln!(out, "Summary");
    let _ = writeln!(out, "  SoR documents:       {}", summary.total_sor);
    let _ = writeln!(out, "  Mirror entries:      {}", summary.total_mirror);
    let _ = writeln!(out, "  Inconsistencies:     {}", summary.total_inconsistencies);
    let _ = writeln!(out, "  Average consistency: {:.2}%", summary.average_consistency);
    let _ = writeln!(out);
    let _ = writeln!(out, "Recommendation: {}", report.recommendation.message());
    out
}

/// `afs-mirror consistency-check`. Drift is reported, never an error.
pub async fn run_consistency_check(config: &Config, json: bool) -> Result<()> {
    let store = SqliteStore::new(db::connect_existing(config).await?);
    for kind in EntityKind::ALL {
        if !store.table_exists(kind).await? {
            bail!(
                "system of record at {} has no {} table; run `afs-mirror init` first",
                config.store.url,
                kind.table()
            );
        }
    }
    let mirror = MirrorStore::new(&config.mirror.root);
    if !mirror.root().exists() {
        warn!(root = %mirror.root().display(), "mirror root does not exist; treating mirror as empty");
    }

    let report = audit(&store, &mirror).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_text(&report, config.audit.preview_limit));
    }
    Ok(())
}
