//! Bulk rebuild tools: SoR → mirror ([`forward`]) and mirror → SoR
//! ([`reverse`]). Both count per-item outcomes per kind; a single failing
//! item never aborts the run.

pub mod forward;
pub mod reverse;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::models::{EntityKind, UpsertOutcome};
use crate::progress::Direction;

/// Per-kind counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KindStats {
    pub total: u64,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub errors: u64,
    pub warnings: u64,
}

impl KindStats {
    pub fn record_upsert(&mut self, outcome: UpsertOutcome) {
        self.processed += 1;
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    fn absorb(&mut self, other: &KindStats) {
        self.total += other.total;
        self.processed += other.processed;
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.errors += other.errors;
        self.warnings += other.warnings;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildSummary {
    #[serde(skip)]
    pub direction: Direction,
    pub kinds: BTreeMap<EntityKind, KindStats>,
    /// Mirror tree digest after a forward rebuild.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl RebuildSummary {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            kinds: EntityKind::ALL
                .into_iter()
                .map(|kind| (kind, KindStats::default()))
                .collect(),
            digest: None,
        }
    }

    pub fn stats(&self, kind: EntityKind) -> KindStats {
        self.kinds.get(&kind).copied().unwrap_or_default()
    }

    pub fn stats_mut(&mut self, kind: EntityKind) -> &mut KindStats {
        self.kinds.entry(kind).or_default()
    }

    pub fn totals(&self) -> KindStats {
        let mut totals = KindStats::default();
        for stats in self.kinds.values() {
            totals.absorb(stats);
        }
        totals
    }

    pub fn print(&self) {
        match self.direction {
            Direction::Forward => println!("forward-rebuild (SoR -> mirror)"),
            Direction::Reverse => println!("reverse-rebuild (mirror -> SoR)"),
        }
        for (kind, stats) in &self.kinds {
            match self.direction {
                Direction::Forward => println!(
                    "  {:<16} total: {}  processed: {}  errors: {}",
                    kind.as_str(),
                    stats.total,
                    stats.processed,
                    stats.errors
                ),
                Direction::Reverse => println!(
                    "  {:<16} total: {}  processed: {}  created: {}  updated: {}  unchanged: {}  skipped: {}  errors: {}  warnings: {}",
                    kind.as_str(),
                    stats.total,
                    stats.processed,
                    stats.created,
                    stats.updated,
                    stats.unchanged,
                    stats.skipped,
                    stats.errors,
                    stats.warnings
                ),
            }
        }
        let totals = self.totals();
        println!("  errors: {}", totals.errors);
        if self.direction == Direction::Reverse {
            println!("  warnings: {}", totals.warnings);
        }
        if let Some(digest) = &self.digest {
            println!("  mirror digest: {}", digest);
        }
        println!("ok");
    }
}
