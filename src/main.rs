//! # AFS Mirror CLI (`afs-mirror`)
//!
//! Operator tools for the SoR and its filesystem mirror: schema setup,
//! consistency audit, rebuild in either direction, and a structural check
//! of the mirror tree.
//!
//! ## Usage
//!
//! ```bash
//! afs-mirror --config ./config/afs.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `afs-mirror init` | Create the SoR tables |
//! | `afs-mirror consistency-check` | Compare SoR and mirror, recommend a repair |
//! | `afs-mirror forward-rebuild` | Rewrite the mirror from the SoR |
//! | `afs-mirror reverse-rebuild` | Restore the SoR from the mirror |
//! | `afs-mirror verify-mirror` | Report structural problems in the mirror |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`; `-v` raises the
//! default level to `debug`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use afs_mirror::progress::ProgressMode;
use afs_mirror::{audit, config, migrate, rebuild, verify};

/// AFS Mirror: replication, audit and recovery between the system of record
/// and its filesystem mirror.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/afs.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "afs-mirror",
    about = "Replication, audit and recovery between the AFS system of record and its filesystem mirror",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/afs.toml`. A missing file means built-in
    /// defaults plus `AFS_DATABASE_URL` / `AFS_MIRROR_ROOT`.
    #[arg(long, global = true, default_value = "./config/afs.toml")]
    config: PathBuf,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the SoR schema. Safe to run repeatedly.
    Init,

    /// Compare the ids held by the SoR and the mirror for every entity type.
    ///
    /// Exits 0 even when the stores disagree; the report carries a
    /// recommendation instead.
    ConsistencyCheck {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Rewrite every mirror file from the SoR.
    ForwardRebuild {
        /// Progress output on stderr. Defaults to `human` on a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Upsert every record found in the mirror back into the SoR.
    ReverseRebuild {
        /// Progress output on stderr. Defaults to `human` on a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Check the mirror tree for unknown files, bad JSON and bad names.
    VerifyMirror,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
        }
        Commands::ConsistencyCheck { json } => {
            audit::run_consistency_check(&cfg, json).await?;
        }
        Commands::ForwardRebuild { progress } => {
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            rebuild::forward::run_forward_rebuild(&cfg, reporter.as_ref()).await?;
        }
        Commands::ReverseRebuild { progress } => {
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            rebuild::reverse::run_reverse_rebuild(&cfg, reporter.as_ref()).await?;
        }
        Commands::VerifyMirror => {
            verify::run_verify_mirror(&cfg)?;
        }
    }

    Ok(())
}
