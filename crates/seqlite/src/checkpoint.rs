//! Cooperative WAL checkpoint orchestration.
//!
//! The engine's WAL hook fires synchronously inside write operations with
//! the current WAL page count. Policy:
//!
//! - Below [`full_checkpoint_page_min`] nothing happens here; passive
//!   checkpoints run opportunistically after successful commits.
//! - At or above it, a detached restart worker is spawned (at most one per
//!   database). The worker quiesces new transactions, asks in-flight ones
//!   to abandon via the progress handler and registered listeners, and runs
//!   `wal_checkpoint_v2(RESTART)` once the transaction count drains to
//!   zero.
//!
//! The worker owns a dedicated connection to the database: checkpointing is
//! a database-level operation, so it never needs to borrow another
//! thread's handle.

use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rusqlite::Connection;
use tracing::{debug, error, info};

use crate::engine::{self, WalCheckpointMode};
use crate::shared::SharedState;

/// WAL page count at which post-commit passive checkpoints start running.
/// Approximately 10 MB at 4 KB pages.
static PASSIVE_CHECKPOINT_PAGE_MIN: AtomicI32 = AtomicI32::new(2_500);

/// WAL page count at which a restart checkpoint is forced. Approximately
/// 100 MB at 4 KB pages.
static FULL_CHECKPOINT_PAGE_MIN: AtomicI32 = AtomicI32::new(25_000);

/// Current passive-checkpoint threshold in WAL pages.
pub fn passive_checkpoint_page_min() -> i32 {
    PASSIVE_CHECKPOINT_PAGE_MIN.load(Ordering::SeqCst)
}

/// Set the passive-checkpoint threshold (process-wide).
pub fn set_passive_checkpoint_page_min(pages: i32) {
    PASSIVE_CHECKPOINT_PAGE_MIN.store(pages, Ordering::SeqCst);
}

/// Current restart-checkpoint threshold in WAL pages.
pub fn full_checkpoint_page_min() -> i32 {
    FULL_CHECKPOINT_PAGE_MIN.load(Ordering::SeqCst)
}

/// Set the restart-checkpoint threshold (process-wide).
pub fn set_full_checkpoint_page_min(pages: i32) {
    FULL_CHECKPOINT_PAGE_MIN.store(pages, Ordering::SeqCst);
}

/// Fleet-wide notification hooks around restart checkpoints.
///
/// Called from the checkpoint worker thread while it holds internal locks:
/// implementations must return quickly and must not re-enter a handle.
/// Registered weakly; dropping the listener unregisters it.
pub trait CheckpointListener: Send + Sync {
    /// A restart checkpoint is waiting; stop issuing long transactions.
    fn checkpoint_required(&self, db: &Path);
    /// The restart checkpoint finished; normal operation may resume.
    fn checkpoint_complete(&self, db: &Path);
}

/// WAL hook policy: record the page count and decide whether a restart
/// worker is needed. Runs synchronously inside the committing write.
pub(crate) fn on_wal_grew(shared: &Arc<SharedState>, db: &Path, db_name: &str, page_count: i32) {
    shared.set_current_page_count(page_count);
    if page_count < full_checkpoint_page_min() {
        return;
    }

    info!(
        pages = page_count,
        db = %db.display(),
        "WAL past restart threshold, beginning complete checkpoint"
    );
    if !shared.try_claim_checkpoint_thread() {
        info!("not starting checkpoint thread, one is already running");
        return;
    }

    let worker_shared = Arc::clone(shared);
    let db = db.to_path_buf();
    let db_name = db_name.to_owned();
    let spawned = std::thread::Builder::new()
        .name("seqlite-checkpoint".to_owned())
        .spawn(move || restart_worker(&worker_shared, &db, &db_name));
    if let Err(e) = spawned {
        error!(error = %e, "failed to spawn checkpoint worker");
        shared.release_checkpoint_thread();
    }
}

/// Body of the detached restart-checkpoint worker.
fn restart_worker(shared: &Arc<SharedState>, db: &Path, db_name: &str) {
    let started = Instant::now();

    let conn = match Connection::open(db) {
        Ok(conn) => conn,
        Err(e) => {
            error!(db = %db.display(), error = %e, "checkpoint worker could not open database");
            shared.release_checkpoint_thread();
            return;
        }
    };

    // Taken exclusively for the whole drain; `wait_for_checkpoint` callers
    // queue behind it in shared mode.
    let _block = shared.block_new_transactions.write();

    loop {
        let mut count = shared.transaction_count_lock().lock();

        // A passive checkpoint may have drained the WAL since this worker
        // was scheduled. Requiring half the threshold avoids bouncing off
        // the limit on the next commit.
        let pages = shared.current_page_count();
        if pages < full_checkpoint_page_min() / 2 {
            info!(pages, "page count decreased below half the threshold, exiting checkpoint loop");
            break;
        }
        info!(remaining = *count, "waiting on open transactions before restart checkpoint");
        shared.notify_checkpoint_required(db);

        if *count == 0 {
            let checkpoint_start = Instant::now();
            info!(
                waited_ms = started.elapsed().as_millis() as u64,
                db_name,
                "starting complete checkpoint"
            );
            let (rc, wal_frames, backfilled) =
                engine::wal_checkpoint(&conn, WalCheckpointMode::Restart);
            info!(
                result = rc,
                frames = backfilled,
                of = wal_frames,
                elapsed_ms = checkpoint_start.elapsed().as_millis() as u64,
                "restart checkpoint complete"
            );
            shared.notify_checkpoint_complete(db);
            break;
        }

        shared.wait_transaction_count_change(&mut count);
    }

    shared.release_checkpoint_thread();
}

/// Post-commit passive checkpoint, run by the committing thread when no
/// restart worker is busy and the WAL has grown past the passive
/// threshold. Passive checkpoints block nobody and need no draining.
pub(crate) fn passive_checkpoint(conn: &Connection, shared: &SharedState) {
    if shared.checkpoint_thread_busy() {
        return;
    }
    if shared.current_page_count() < passive_checkpoint_page_min() {
        return;
    }
    let start = Instant::now();
    let (rc, wal_frames, backfilled) = engine::wal_checkpoint(conn, WalCheckpointMode::Passive);
    debug!(
        pages = shared.current_page_count(),
        result = rc,
        frames = backfilled,
        of = wal_frames,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "passive checkpoint complete"
    );
}
