//! # AFS Mirror
//!
//! Keeps a human-readable filesystem mirror of the AFS system of record
//! (SoR) up to date, and repairs either side when they drift.
//!
//! Mutations on the SoR fire post-write hooks. The hooks feed a debounced,
//! deduplicating queue; each flushed entry takes a type-scoped lock,
//! re-reads the document from the SoR and rewrites its mirror files
//! atomically. Separate tools audit the two stores and rebuild one from the
//! other.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ hook ┌───────────┐ flush ┌────────────┐
//! │ RecordStore  │─────▶│ SyncQueue │──────▶│ MirrorSync │──▶ <root>/...
//! │ (SQLite SoR) │      │ debounce  │       │ lock+fetch │
//! └──────┬───────┘      └───────────┘       └────────────┘
//!        │                                        ▲
//!        └──── audit / forward / reverse ─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! afs-mirror init                   # create the SoR schema
//! afs-mirror consistency-check      # compare SoR and mirror
//! afs-mirror forward-rebuild        # SoR -> mirror
//! afs-mirror reverse-rebuild        # mirror -> SoR
//! afs-mirror verify-mirror          # structural check of the tree
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`models`] | Entity kinds, ids and record shapes |
//! | [`store`] | `RecordStore` trait, SQLite and in-memory backends |
//! | [`capture`] | Post-mutation hook registration |
//! | [`queue`] | Debounced, deduplicating sync queue |
//! | [`lock`] | Type-scoped cross-process file lock |
//! | [`sync`] | Per-entry lock, re-fetch and write |
//! | [`mirror`] | Mirror layout, atomic writers and readers |
//! | [`audit`] | Consistency auditor |
//! | [`rebuild`] | Forward and reverse rebuild |
//! | [`verify`] | Mirror structure verifier |
//! | [`replication`] | Wires capture, queue and sync together |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod audit;
pub mod capture;
pub mod config;
pub mod db;
pub mod derive;
pub mod error;
pub mod lock;
pub mod migrate;
pub mod mirror;
pub mod models;
pub mod progress;
pub mod queue;
pub mod rebuild;
pub mod replication;
pub mod store;
pub mod sync;
pub mod verify;
