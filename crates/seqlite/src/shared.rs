//! Process-wide state shared by every handle on the same database file.
//!
//! One [`SharedState`] exists per canonical filename (see
//! [`crate::registry::Registry`]). It owns the monotonic commit counter and
//! hash chain head, the commit lock that serializes the prepare→commit
//! window, the quiesce lock and counters the checkpoint coordinator drives,
//! and the prepared/committed transaction queues replication drains.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Weak;

use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Condvar, Mutex, RawMutex, RwLock};
use tracing::debug;

use crate::checkpoint::CheckpointListener;

/// What the journal records for one transaction: the concatenated SQL of
/// its effective writes, the chained hash, and the commit count the handle
/// observed at `begin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    pub query: String,
    pub hash: String,
    pub db_count_at_start: u64,
}

#[derive(Default)]
struct InternalState {
    prepared: BTreeMap<u64, TransactionInfo>,
    committed: BTreeMap<u64, TransactionInfo>,
    listeners: Vec<Weak<dyn CheckpointListener>>,
}

/// Cross-handle coordination state for one database file.
pub struct SharedState {
    /// Highest committed journal id.
    commit_count: AtomicU64,
    /// Hex hash of the last committed transaction; chain head.
    last_committed_hash: Mutex<String>,
    /// Serializes the prepare→commit window across handles. Raw because it
    /// is locked in one method call and released in another; each handle
    /// tracks held-ness with a boolean.
    pub(crate) commit_lock: RawMutex,
    /// Held exclusively by the restart checkpoint worker; taken shared by
    /// `wait_for_checkpoint` callers who serialize their begins behind it.
    pub(crate) block_new_transactions: RwLock<()>,
    /// Open transactions across all handles, with the condvar the
    /// checkpoint worker waits on.
    transaction_count: Mutex<u64>,
    transaction_count_changed: Condvar,
    /// At most one restart checkpoint at a time.
    checkpoint_thread_busy: AtomicBool,
    /// Last WAL page count reported by the WAL hook.
    current_page_count: AtomicI32,
    /// Round-robin cursor for assigning journal tables to new handles.
    next_journal_count: AtomicU64,
    internal: Mutex<InternalState>,
}

impl SharedState {
    pub(crate) fn new(commit_count: u64, last_committed_hash: String) -> Self {
        Self {
            commit_count: AtomicU64::new(commit_count),
            last_committed_hash: Mutex::new(last_committed_hash),
            commit_lock: RawMutex::INIT,
            block_new_transactions: RwLock::new(()),
            transaction_count: Mutex::new(0),
            transaction_count_changed: Condvar::new(),
            checkpoint_thread_busy: AtomicBool::new(false),
            current_page_count: AtomicI32::new(0),
            next_journal_count: AtomicU64::new(0),
            internal: Mutex::new(InternalState::default()),
        }
    }

    /// Highest committed journal id.
    pub fn commit_count(&self) -> u64 {
        self.commit_count.load(Ordering::SeqCst)
    }

    /// Hash of the last committed transaction; empty before the first.
    pub fn last_committed_hash(&self) -> String {
        self.last_committed_hash.lock().clone()
    }

    /// Record a successful commit: bump the counter, move the prepared
    /// entry into the committed queue, and advance the chain head. Called
    /// with the commit lock held.
    pub(crate) fn increment_commit(&self, hash: &str) {
        let mut internal = self.internal.lock();
        let id = self.commit_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(info) = internal.prepared.remove(&id) {
            internal.committed.insert(id, info);
        }
        *self.last_committed_hash.lock() = hash.to_owned();
    }

    /// Register the transaction a handle is about to insert into the
    /// journal under `commit_id`.
    pub(crate) fn note_prepared(&self, commit_id: u64, info: TransactionInfo) {
        self.internal.lock().prepared.insert(commit_id, info);
    }

    /// Drop the prepared entry for a rolled-back transaction.
    pub(crate) fn discard_prepared(&self, commit_id: u64) {
        self.internal.lock().prepared.remove(&commit_id);
    }

    /// Return and clear everything committed since the last pop, keyed by
    /// commit id in ascending order.
    pub fn pop_committed_transactions(&self) -> BTreeMap<u64, TransactionInfo> {
        std::mem::take(&mut self.internal.lock().committed)
    }

    // -- transaction counting -------------------------------------------

    pub(crate) fn note_transaction_started(&self) {
        *self.transaction_count.lock() += 1;
        self.transaction_count_changed.notify_one();
    }

    pub(crate) fn note_transaction_finished(&self) {
        {
            let mut count = self.transaction_count.lock();
            debug_assert!(*count > 0);
            *count = count.saturating_sub(1);
        }
        self.transaction_count_changed.notify_one();
    }

    /// Open transactions across every handle on this file.
    pub fn transaction_count(&self) -> u64 {
        *self.transaction_count.lock()
    }

    pub(crate) fn transaction_count_lock(&self) -> &Mutex<u64> {
        &self.transaction_count
    }

    pub(crate) fn wait_transaction_count_change(
        &self,
        guard: &mut parking_lot::MutexGuard<'_, u64>,
    ) {
        self.transaction_count_changed.wait(guard);
    }

    // -- checkpoint coordination ----------------------------------------

    /// Claim the single restart-checkpoint slot; returns false when a
    /// worker is already running.
    pub(crate) fn try_claim_checkpoint_thread(&self) -> bool {
        !self.checkpoint_thread_busy.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn release_checkpoint_thread(&self) {
        self.checkpoint_thread_busy.store(false, Ordering::SeqCst);
    }

    /// Whether a restart checkpoint worker is running.
    pub fn checkpoint_thread_busy(&self) -> bool {
        self.checkpoint_thread_busy.load(Ordering::SeqCst)
    }

    pub(crate) fn set_current_page_count(&self, pages: i32) {
        self.current_page_count.store(pages, Ordering::SeqCst);
    }

    /// Last WAL page count reported by the WAL hook.
    pub fn current_page_count(&self) -> i32 {
        self.current_page_count.load(Ordering::SeqCst)
    }

    /// Next slot in the round-robin journal assignment for handle copies.
    pub(crate) fn next_journal_index(&self) -> u64 {
        self.next_journal_count.fetch_add(1, Ordering::SeqCst)
    }

    // -- listeners ------------------------------------------------------

    /// Register a checkpoint listener; held weakly, so dropping the
    /// listener unregisters it.
    pub fn add_checkpoint_listener(&self, listener: Weak<dyn CheckpointListener>) {
        self.internal.lock().listeners.push(listener);
    }

    /// Remove a previously registered listener.
    pub fn remove_checkpoint_listener(&self, listener: &Weak<dyn CheckpointListener>) {
        self.internal
            .lock()
            .listeners
            .retain(|l| !l.ptr_eq(listener) && l.strong_count() > 0);
    }

    /// Notify listeners that a restart checkpoint is waiting on in-flight
    /// transactions. Called from the worker thread with the internal state
    /// lock held; listeners must not re-enter a handle.
    pub(crate) fn notify_checkpoint_required(&self, db: &Path) {
        let mut internal = self.internal.lock();
        internal.listeners.retain(|l| l.strong_count() > 0);
        for listener in &internal.listeners {
            if let Some(listener) = listener.upgrade() {
                listener.checkpoint_required(db);
            }
        }
    }

    /// Notify listeners that the restart checkpoint finished.
    pub(crate) fn notify_checkpoint_complete(&self, db: &Path) {
        let internal = self.internal.lock();
        for listener in &internal.listeners {
            if let Some(listener) = listener.upgrade() {
                listener.checkpoint_complete(db);
            }
        }
        debug!(db = %db.display(), "checkpoint listeners notified of completion");
    }
}
