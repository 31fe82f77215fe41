//! `beads` is a distributed issue tracker whose database lives per-workspace
//! and synchronizes between clones through a shared, version-controlled
//! JSON-Lines file (the ledger).
//!
//! The crate is the synchronization core: an append-only issue store, a
//! deterministic ledger codec, a content-hash staleness oracle, a debounced
//! flush scheduler, an inter-process ledger lock, a deletion manifest with a
//! resurrection sanitizer, a three-way merge engine, and a worktree
//! controller that isolates ledger commits on a dedicated VCS branch.
//!
//! ## Getting started
//!
//! ```no_run
//! use beads::error::CResult;
//! use beads::model::{new_issue_id, Issue};
//! use beads::sync::{SyncAction, SyncContext};
//!
//! fn run() -> CResult<()> {
//!     let mut ctx = SyncContext::init(std::path::Path::new("."), "bd", "alice")?;
//!
//!     let now = ctx.now();
//!     let id = new_issue_id("bd", "write the docs", now);
//!     ctx.store.create(Issue::new(id, "write the docs", now), "alice", now)?;
//!
//!     // Flush the store to the ledger, then report.
//!     ctx.sync(SyncAction::ExportOnly, None)?;
//!     let status = ctx.status()?;
//!     println!("{} open issues", status.stats.open);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod flush;
pub mod lock;
pub mod manifest;
pub mod model;
pub mod sanitize;
pub mod storage;
pub mod sync;
pub mod vcs;
pub mod worktree;
