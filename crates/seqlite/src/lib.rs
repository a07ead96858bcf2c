//! Transactional coordination over an embedded SQL engine.
//!
//! seqlite wraps SQLite to turn its single-process concurrency primitives
//! into a replication-ready commit pipeline:
//!
//! - [`Handle`]: per-thread connection with a begin / read / write /
//!   prepare / commit / rollback state machine and deterministic commit
//!   ordering across handles on the same file.
//! - Journal: every committed transaction is recorded as
//!   `(id, query, hash)` in sharded journal tables, hash-chained with
//!   SHA-1 so followers can replay and verify history.
//! - Checkpoint coordination: passive checkpoints ride along after
//!   commits; when the WAL grows past [`full_checkpoint_page_min`] a
//!   restart worker quiesces new transactions, interrupts in-flight ones
//!   cooperatively, and truncates the WAL.
//! - [`authorizer::Whitelist`] and query rewriting via the engine's
//!   authorizer hook.
//!
//! One [`shared::SharedState`] exists per canonical database path; handles
//! discover it through a [`Registry`] (process-global by default, explicit
//! for tests).

use std::sync::atomic::{AtomicBool, Ordering};

pub mod authorizer;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod handle;
pub mod journal;
pub mod registry;
pub mod schema;
pub mod shared;

pub use authorizer::{RewriteHandler, Whitelist};
pub use checkpoint::{
    full_checkpoint_page_min, passive_checkpoint_page_min, set_full_checkpoint_page_min,
    set_passive_checkpoint_page_min, CheckpointListener,
};
pub use config::OpenConfig;
pub use engine::QueryResult;
pub use handle::{CommitResult, Handle, TransactionKind, TransactionTiming};
pub use journal::chain_hash;
pub use registry::{resolve_filename, Registry, MEMORY_FILENAME};
pub use schema::SchemaCheck;
pub use seqlite_error::{Error, Result};
pub use shared::{SharedState, TransactionInfo};

static STATEMENT_TRACE: AtomicBool = AtomicBool::new(false);

/// Globally enable or disable logging of every statement the engine runs.
/// Tracing is process-wide, not per handle.
pub fn set_statement_trace(enabled: bool) {
    STATEMENT_TRACE.store(enabled, Ordering::SeqCst);
}

/// Whether process-wide statement tracing is on.
#[must_use]
pub fn statement_trace_enabled() -> bool {
    STATEMENT_TRACE.load(Ordering::SeqCst)
}
