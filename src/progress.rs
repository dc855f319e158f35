//! Rebuild progress reporting.
//!
//! Bulk tools report what they are walking and how far they are. Progress is
//! emitted on **stderr** so stdout stays parseable for scripts.

use std::io::Write;

use crate::models::EntityKind;

/// Which way a rebuild copies data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Reverse => "reverse",
        }
    }
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum RebuildProgressEvent {
    /// Enumerating the source side for a kind; total unknown.
    Scanning {
        direction: Direction,
        kind: EntityKind,
    },
    /// `n` of `total` items of a kind handled.
    Copying {
        direction: Direction,
        kind: EntityKind,
        n: u64,
        total: u64,
    },
}

pub trait RebuildProgressReporter: Send + Sync {
    fn report(&self, event: RebuildProgressEvent);
}

/// Human-friendly progress on stderr: "forward answer  copying  1,234 / 5,000 items".
pub struct StderrProgress;

impl RebuildProgressReporter for StderrProgress {
    fn report(&self, event: RebuildProgressEvent) {
        let line = match &event {
            RebuildProgressEvent::Scanning { direction, kind } => {
                format!("{} {}  scanning...\n", direction.as_str(), kind)
            }
            RebuildProgressEvent::Copying {
                direction,
                kind,
                n,
                total,
            } => format!(
                "{} {}  copying  {} / {} items\n",
                direction.as_str(),
                kind,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RebuildProgressReporter for JsonProgress {
    fn report(&self, event: RebuildProgressEvent) {
        let obj = match &event {
            RebuildProgressEvent::Scanning { direction, kind } => serde_json::json!({
                "event": "progress",
                "direction": direction.as_str(),
                "kind": kind,
                "phase": "scanning"
            }),
            RebuildProgressEvent::Copying {
                direction,
                kind,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "direction": direction.as_str(),
                "kind": kind,
                "phase": "copying",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl RebuildProgressReporter for NoProgress {
    fn report(&self, _event: RebuildProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn RebuildProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

/// Whether to emit an event for item `n` of `total`: the first, the last, and
/// every `every`th in between.
pub fn should_report(n: u64, total: u64, every: u64) -> bool {
    n == 1 || n == total || (every > 0 && n % every == 0)
}
