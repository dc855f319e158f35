//! Read-only structural check of the mirror tree.
//!
//! Touches neither store. Every visible file is matched against the known
//! layout and parsed as JSON; directory names must be valid ids, and every
//! answer/session directory must hold its snapshot file.

use std::path::Path;

use anyhow::{bail, Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Serialize;
use walkdir::{DirEntry, WalkDir};

use crate::config::Config;
use crate::mirror::memory::{FAMILY_CATEGORY, FRIEND_CATEGORY, SELF_CATEGORY, SELF_CONTRIBUTOR};
use crate::mirror::{
    is_hidden, MirrorStore, ANSWERS_DIR, ANSWER_FILE, OWNER_FILES, SESSIONS_DIR, SESSION_FILE,
};
use crate::models::{AnswerId, OwnerId, QuestionLayer, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyIssue {
    /// Path relative to the mirror root, `/`-separated.
    pub path: String,
    pub problem: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct VerifyReport {
    pub files_checked: u64,
    pub issues: Vec<VerifyIssue>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    fn flag(&mut self, path: &str, problem: impl Into<String>) {
        self.issues.push(VerifyIssue {
            path: path.to_string(),
            problem: problem.into(),
        });
    }
}

/// Known file locations, split by the first path segment.
struct Layout {
    snapshots: GlobSet,
    owners: GlobSet,
}

impl Layout {
    fn new() -> Result<Self> {
        let layers = format!(
            "{{{},{}}}",
            QuestionLayer::Basic.as_str(),
            QuestionLayer::Emotional.as_str()
        );

        let snapshots = build_globset(&[
            format!("{}/*/{}", ANSWERS_DIR, ANSWER_FILE),
            format!("{}/*/{}", SESSIONS_DIR, SESSION_FILE),
        ])?;

        let mut owner_patterns: Vec<String> =
            OWNER_FILES.iter().map(|file| format!("*/{}", file)).collect();
        owner_patterns.push(format!(
            "*/{}/{}/{}/question_*.json",
            SELF_CATEGORY, SELF_CONTRIBUTOR, layers
        ));
        for category in [FAMILY_CATEGORY, FRIEND_CATEGORY] {
            owner_patterns.push(format!("*/{}/*/{}/question_*.json", category, layers));
        }
        let owners = build_globset(&owner_patterns)?;

        Ok(Self { snapshots, owners })
    }

    fn is_known(&self, relative: &str) -> bool {
        match relative.split('/').next() {
            Some(ANSWERS_DIR) | Some(SESSIONS_DIR) => self.snapshots.is_match(relative),
            _ => self.owners.is_match(relative),
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).literal_separator(true).build()?);
    }
    Ok(builder.build()?)
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

pub fn verify_mirror(mirror: &MirrorStore) -> Result<VerifyReport> {
    let root = mirror.root();
    if !root.is_dir() {
        bail!("mirror root {} is not a readable directory", root.display());
    }

    let layout = Layout::new()?;
    let mut report = VerifyReport::default();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if entry.depth() == 0 {
            continue;
        }
        let relative = relative_path(root, entry.path());

        if entry.file_type().is_dir() {
            check_dir(&entry, &relative, &mut report);
        } else if entry.file_type().is_file() {
            report.files_checked += 1;
            check_file(&layout, &entry, &relative, &mut report);
        }
    }

    Ok(report)
}

fn check_dir(entry: &DirEntry, relative: &str, report: &mut VerifyReport) {
    let name = entry.file_name().to_string_lossy();
    let segments: Vec<&str> = relative.split('/').collect();

    match segments.as_slice() {
        [ANSWERS_DIR] | [SESSIONS_DIR] => {}
        [_owner] => {
            if let Err(e) = OwnerId::parse(name.to_string()) {
                report.flag(relative, e.to_string());
            }
        }
        [ANSWERS_DIR, _] => {
            if let Err(e) = AnswerId::parse(name.to_string()) {
                report.flag(relative, e.to_string());
            }
            if !entry.path().join(ANSWER_FILE).is_file() {
                report.flag(relative, format!("missing {}", ANSWER_FILE));
            }
        }
        [SESSIONS_DIR, _] => {
            if let Err(e) = SessionId::parse(name.to_string()) {
                report.flag(relative, e.to_string());
            }
            if !entry.path().join(SESSION_FILE).is_file() {
                report.flag(relative, format!("missing {}", SESSION_FILE));
            }
        }
        [_owner, category] => {
            if ![SELF_CATEGORY, FAMILY_CATEGORY, FRIEND_CATEGORY].contains(category) {
                report.flag(relative, "unknown memory category");
            }
        }
        _ => {}
    }
}

fn check_file(layout: &Layout, entry: &DirEntry, relative: &str, report: &mut VerifyReport) {
    if !layout.is_known(relative) {
        report.flag(relative, "unexpected file");
    }

    let is_json = entry
        .path()
        .extension()
        .map_or(false, |ext| ext == "json");
    if !is_json {
        return;
    }

    match std::fs::read(entry.path()) {
        Ok(bytes) => {
            if let Err(e) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                report.flag(relative, format!("unparsable JSON: {}", e));
            }
        }
        Err(e) => report.flag(relative, format!("unreadable: {}", e)),
    }
}

fn print_report(report: &VerifyReport) {
    println!("verify-mirror");
    println!("  files checked: {}", report.files_checked);
    for issue in &report.issues {
        println!("  {}: {}", issue.path, issue.problem);
    }
    println!("  issues: {}", report.issues.len());
}

/// `afs-mirror verify-mirror`.
pub fn run_verify_mirror(config: &Config) -> Result<()> {
    let mirror = MirrorStore::new(&config.mirror.root);
    let report = verify_mirror(&mirror)?;
    print_report(&report);
    Ok(())
}
