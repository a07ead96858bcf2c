//! The per-thread database handle and its transaction state machine.
//!
//! A [`Handle`] owns one engine connection and moves through
//! Idle → Active (`begin`) → Prepared (`prepare`) → Idle (`commit` /
//! `rollback`). Commit order is serialized across handles by the shared
//! commit lock: EXCLUSIVE transactions take it at `begin`, SHARED ones at
//! `prepare`, and it is held until `commit` succeeds or `rollback` runs.
//! A commit that loses a write-set conflict returns
//! [`CommitResult::Conflict`] with the lock still held; the caller must
//! roll back.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::lock_api::RawMutex as _;
use rusqlite::{params, Connection};
use seqlite_error::{Error, Result, CODE_AUTH, CODE_BUSY};
use tracing::{debug, error, info, warn};

use crate::authorizer::{AuthorizerState, RewriteHandler, Whitelist};
use crate::checkpoint::{self, CheckpointListener};
use crate::config::OpenConfig;
use crate::engine::{self, HookState, InterruptState, QueryResult};
use crate::journal;
use crate::registry::{self, Registry};
use crate::shared::{SharedState, TransactionInfo};

/// How a transaction takes the commit lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Lock at `prepare`; writers run optimistically until then.
    Shared,
    /// Lock at `begin`; the whole transaction excludes other committers.
    Exclusive,
}

/// Outcome of [`Handle::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum CommitResult {
    /// The transaction is durable and the journal row is visible.
    Committed,
    /// The write set collided with a concurrent commit. The commit lock is
    /// still held; call [`Handle::rollback`] to release it, then retry.
    Conflict,
}

/// Wall-clock spent in each phase of the last transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionTiming {
    pub begin: Duration,
    pub read: Duration,
    pub write: Duration,
    pub prepare: Duration,
    pub commit: Duration,
    pub rollback: Duration,
}

impl TransactionTiming {
    /// Total time across all phases.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.begin + self.read + self.write + self.prepare + self.commit + self.rollback
    }
}

/// Owned per-thread wrapper around one connection to the database.
///
/// Handles referencing the same file share one [`SharedState`]; create
/// additional handles for other threads with [`Handle::duplicate`].
pub struct Handle {
    // Field order matters: the connection must close before the hook state
    // it points at is freed.
    conn: Connection,
    hooks: Box<HookState>,
    filename: PathBuf,
    config: OpenConfig,
    journal_names: Vec<String>,
    journal_name: String,
    journal_size: u64,
    supports_concurrent: bool,
    inside_transaction: bool,
    commit_lock_held: bool,
    uncommitted_query: String,
    uncommitted_hash: String,
    prepared_commit_id: Option<u64>,
    db_count_at_start: u64,
    auto_rolled_back: bool,
    noop_update_mode: bool,
    query_cache: HashMap<String, QueryResult>,
    query_count: u64,
    cache_hits: u64,
    timing: TransactionTiming,
}

impl Handle {
    /// Open a handle through the process-wide registry.
    pub fn open(config: OpenConfig) -> Result<Self> {
        Self::open_in(config, Registry::global())
    }

    /// Open a handle with an explicit registry (isolated shared state for
    /// tests and embedders that manage their own lifecycle).
    pub fn open_in(config: OpenConfig, registry: &Registry) -> Result<Self> {
        config.validate()?;
        let filename = registry::resolve_filename(&config.filename)?;
        let conn = engine::open_connection(&filename, &config)?;
        journal::ensure_tables(&conn, config.min_journal_tables)?;
        let journal_names = journal::discover_tables(&conn)?;
        let shared = registry.shared_for(&conn, &filename, &journal_names)?;
        let journal_size = journal::journal_span(&conn, &journal_names)?;
        let journal_name = journal_names[0].clone();
        Self::finish_open(
            conn,
            config,
            filename,
            journal_names,
            journal_name,
            journal_size,
            shared,
        )
    }

    /// A second handle on the same database for another thread: new
    /// connection, shared coordination state, journal table assigned
    /// round-robin among the suffixed tables (the unsuffixed `journal`
    /// stays reserved for the first handle).
    pub fn duplicate(&self) -> Result<Self> {
        let conn = engine::open_connection(&self.filename, &self.config)?;
        let journal_names = self.journal_names.clone();
        let journal_name = if journal_names.len() > 1 {
            let slot = usize::try_from(self.hooks.shared.next_journal_index())
                .unwrap_or(0)
                % (journal_names.len() - 1);
            journal_names[1 + slot].clone()
        } else {
            journal_names[0].clone()
        };
        Self::finish_open(
            conn,
            self.config.clone(),
            self.filename.clone(),
            journal_names,
            journal_name,
            self.journal_size,
            Arc::clone(&self.hooks.shared),
        )
    }

    fn finish_open(
        conn: Connection,
        config: OpenConfig,
        filename: PathBuf,
        journal_names: Vec<String>,
        journal_name: String,
        journal_size: u64,
        shared: Arc<SharedState>,
    ) -> Result<Self> {
        let hooks = Box::new(HookState {
            shared,
            interrupt: InterruptState::new(),
            auth: AuthorizerState::new(),
            filename: filename.clone(),
        });
        engine::install_hooks(&conn, &hooks, config.progress_step_interval);
        let supports_concurrent = engine::probe_begin_concurrent(&conn);
        if !supports_concurrent {
            debug!(db = %filename.display(), "engine lacks BEGIN CONCURRENT, using BEGIN");
        }
        Ok(Self {
            conn,
            hooks,
            filename,
            config,
            journal_names,
            journal_name,
            journal_size,
            supports_concurrent,
            inside_transaction: false,
            commit_lock_held: false,
            uncommitted_query: String::new(),
            uncommitted_hash: String::new(),
            prepared_commit_id: None,
            db_count_at_start: 0,
            auto_rolled_back: false,
            noop_update_mode: false,
            query_cache: HashMap::new(),
            query_count: 0,
            cache_hits: 0,
            timing: TransactionTiming::default(),
        })
    }

    // -- accessors ------------------------------------------------------

    /// Canonical filename of the database.
    #[must_use]
    pub fn filename(&self) -> &PathBuf {
        &self.filename
    }

    /// The journal table this handle commits into.
    #[must_use]
    pub fn journal_table(&self) -> &str {
        &self.journal_name
    }

    /// The coordination state shared by every handle on this file.
    #[must_use]
    pub fn shared_state(&self) -> &SharedState {
        &self.hooks.shared
    }

    /// Whether a transaction is open on this handle.
    #[must_use]
    pub fn inside_transaction(&self) -> bool {
        self.inside_transaction
    }

    /// Highest committed journal id.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.hooks.shared.commit_count()
    }

    /// Hash of the last committed transaction.
    #[must_use]
    pub fn committed_hash(&self) -> String {
        self.hooks.shared.last_committed_hash()
    }

    /// The commit count observed when the current transaction began. May
    /// lag the true count by concurrent commits that landed right after
    /// `BEGIN`; consumers treat it as a lower bound.
    #[must_use]
    pub fn db_count_at_start(&self) -> u64 {
        self.db_count_at_start
    }

    /// Queries issued in the current transaction so far.
    #[must_use]
    pub fn query_count(&self) -> u64 {
        self.query_count
    }

    /// Reads served from the result cache in the current transaction.
    #[must_use]
    pub fn cache_hit_count(&self) -> u64 {
        self.cache_hits
    }

    /// Rowid of the last insert on this connection.
    #[must_use]
    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    /// Rows changed by the most recent statement.
    #[must_use]
    pub fn last_write_change_count(&self) -> usize {
        usize::try_from(self.conn.changes()).unwrap_or(0)
    }

    /// Per-phase timing of the most recent transaction.
    #[must_use]
    pub fn last_transaction_timing(&self) -> TransactionTiming {
        self.timing
    }

    // -- transaction lifecycle ------------------------------------------

    /// Begin a transaction. EXCLUSIVE takes the commit lock now; SHARED
    /// defers it to [`Handle::prepare`].
    pub fn begin(&mut self, kind: TransactionKind) -> Result<()> {
        if self.inside_transaction {
            return Err(Error::NestedTransaction);
        }
        debug_assert!(self.uncommitted_query.is_empty());
        debug_assert!(self.uncommitted_hash.is_empty());

        if kind == TransactionKind::Exclusive {
            self.hooks.shared.commit_lock.lock();
            self.commit_lock_held = true;
        }
        self.hooks.shared.note_transaction_started();

        // Reset before the query; the engine callbacks can set these.
        self.hooks
            .interrupt
            .abandon_for_checkpoint
            .store(false, Ordering::Relaxed);
        self.auto_rolled_back = false;

        debug!("beginning transaction");
        let before = Instant::now();
        let begin_sql = if self.supports_concurrent {
            "BEGIN CONCURRENT"
        } else {
            "BEGIN"
        };
        match engine::run_batch(&self.conn, begin_sql) {
            Ok(()) => {
                self.inside_transaction = true;
                // Read without the commit lock: another handle may commit
                // between BEGIN and this load, which only makes the
                // snapshot conservatively stale.
                self.db_count_at_start = self.hooks.shared.commit_count();
                self.query_cache.clear();
                self.query_count = 0;
                self.cache_hits = 0;
                self.timing = TransactionTiming {
                    begin: before.elapsed(),
                    ..TransactionTiming::default()
                };
                Ok(())
            }
            Err(e) => {
                self.hooks.shared.note_transaction_finished();
                if self.commit_lock_held {
                    self.commit_lock_held = false;
                    unsafe { self.hooks.shared.commit_lock.unlock() };
                }
                Err(engine::from_engine(e))
            }
        }
    }

    /// Execute a read query, serving repeats from the per-transaction
    /// cache when the statement is deterministic.
    pub fn read(&mut self, query: &str) -> Result<QueryResult> {
        let before = Instant::now();
        self.query_count += 1;
        if let Some(cached) = self.query_cache.get(query) {
            self.cache_hits += 1;
            return Ok(cached.clone());
        }

        self.hooks.auth.deterministic.store(true, Ordering::Relaxed);
        let result = engine::query(&self.conn, query);
        if let Ok(rows) = &result {
            if self.hooks.auth.deterministic.load(Ordering::Relaxed) {
                self.query_cache.insert(query.to_owned(), rows.clone());
            }
        }
        self.check_interrupt_errors("read")?;
        self.timing.read += before.elapsed();
        result.map_err(engine::from_engine)
    }

    /// First cell of the first row of `query`, as text.
    pub fn read_scalar(&mut self, query: &str) -> Result<Option<String>> {
        Ok(self.read(query)?.scalar())
    }

    /// Execute a write. In noop-update mode non-idempotent writes are
    /// skipped (logged, reported as success); use
    /// [`Handle::write_idempotent`] for statements safe to replay.
    pub fn write(&mut self, query: &str) -> Result<()> {
        if self.noop_update_mode {
            warn!(query, "non-idempotent write skipped in noop-update mode");
            return Ok(());
        }
        self.write_internal(query, false)
    }

    /// Execute a write that is safe to replay; runs in noop-update mode.
    pub fn write_idempotent(&mut self, query: &str) -> Result<()> {
        self.write_internal(query, false)
    }

    /// Execute a write and record it in the uncommitted buffer even when
    /// the engine reports it changed nothing.
    pub fn write_unmodified(&mut self, query: &str) -> Result<()> {
        self.write_internal(query, true)
    }

    fn write_internal(&mut self, query: &str, always_keep: bool) -> Result<()> {
        if !self.inside_transaction {
            return Err(Error::NoActiveTransaction);
        }
        // Replication replays the buffer as one script; statements must be
        // self-terminating.
        debug_assert!(query.is_empty() || query.trim_end().ends_with(';'));
        self.query_cache.clear();
        self.query_count += 1;

        let schema_before = engine::schema_version(&self.conn).map_err(engine::from_engine)?;
        let changes_before = engine::total_changes(&self.conn);

        let before = Instant::now();
        let mut executed_rewritten: Option<String> = None;
        let exec_result = if self.hooks.auth.rewrite_enabled.load(Ordering::Relaxed) {
            match engine::run_batch(&self.conn, query) {
                Err(e)
                    if engine::extended_code(&e).map(|c| c & 0xff) == Some(CODE_AUTH) =>
                {
                    // The authorizer denied the original on behalf of the
                    // rewrite handler; run the stored replacement.
                    let rewritten = self.hooks.auth.rewritten_query.lock().clone();
                    self.hooks
                        .auth
                        .running_rewritten
                        .store(true, Ordering::Relaxed);
                    let result = engine::run_batch(&self.conn, &rewritten);
                    self.hooks
                        .auth
                        .running_rewritten
                        .store(false, Ordering::Relaxed);
                    executed_rewritten = Some(rewritten);
                    result
                }
                other => other,
            }
        } else {
            engine::run_batch(&self.conn, query)
        };
        self.check_interrupt_errors("write")?;
        self.timing.write += before.elapsed();
        exec_result.map_err(engine::from_engine)?;

        let schema_after = engine::schema_version(&self.conn).map_err(engine::from_engine)?;
        let changes_after = engine::total_changes(&self.conn);
        if always_keep || schema_after > schema_before || changes_after > changes_before {
            self.uncommitted_query
                .push_str(executed_rewritten.as_deref().unwrap_or(query));
        }
        Ok(())
    }

    /// Assign the next commit id and stage the journal row. This is the
    /// point that serializes commit order: the commit lock is taken here
    /// (if not already held) and kept through `commit`.
    ///
    /// Returns `false` when the journal insert failed; the transaction has
    /// then already been rolled back.
    pub fn prepare(&mut self) -> Result<bool> {
        if !self.inside_transaction {
            return Err(Error::NoActiveTransaction);
        }
        if !self.commit_lock_held {
            self.hooks.shared.commit_lock.lock();
            self.commit_lock_held = true;
        }

        // Holding the commit lock freezes both values.
        let commit_count = self.hooks.shared.commit_count();
        let last_committed_hash = self.hooks.shared.last_committed_hash();
        self.uncommitted_hash = journal::chain_hash(&last_committed_hash, &self.uncommitted_query);

        let commit_id = commit_count + 1;
        self.hooks.shared.note_prepared(
            commit_id,
            TransactionInfo {
                query: self.uncommitted_query.clone(),
                hash: self.uncommitted_hash.clone(),
                db_count_at_start: self.db_count_at_start,
            },
        );
        self.prepared_commit_id = Some(commit_id);

        let before = Instant::now();
        let inserted = self.conn.execute(
            &format!("INSERT INTO {} VALUES (?1, ?2, ?3)", self.journal_name),
            params![
                i64::try_from(commit_id).unwrap_or(i64::MAX),
                self.uncommitted_query,
                self.uncommitted_hash
            ],
        );
        self.timing.prepare += before.elapsed();
        match inserted {
            Ok(_) => {
                debug!(commit_id, "prepared transaction");
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "unable to prepare transaction, rolling back");
                self.rollback();
                Ok(false)
            }
        }
    }

    /// Commit the prepared transaction.
    ///
    /// On [`CommitResult::Conflict`] the commit lock is **still held** and
    /// the caller must invoke [`Handle::rollback`] to release it.
    ///
    /// # Panics
    ///
    /// Any engine result other than success or busy/conflict after a
    /// successful prepare means the journal row and the data diverged;
    /// that is unrecoverable and aborts.
    pub fn commit(&mut self) -> Result<CommitResult> {
        if !self.inside_transaction {
            return Err(Error::NoActiveTransaction);
        }
        if self.uncommitted_hash.is_empty() {
            return Err(Error::NotPrepared);
        }

        // Trim the journal as we go.
        let mut new_journal_size = self.journal_size + 1;
        if new_journal_size > self.config.max_journal_size {
            let before = Instant::now();
            new_journal_size = journal::trim_oldest(
                &self.conn,
                &self.journal_name,
                self.config.max_journal_size,
            )?;
            self.timing.write += before.elapsed();
        }

        debug!("committing transaction");
        let pages_before = self
            .config
            .page_logging
            .then(|| engine::cache_written_pages(&self.conn));

        let before = Instant::now();
        let committed = engine::run_batch(&self.conn, "COMMIT");
        // Re-arm on any completion attempt, successful or not.
        self.hooks
            .interrupt
            .checkpoint_interrupt_enabled
            .store(true, Ordering::Relaxed);

        match committed {
            Ok(()) => {
                self.timing.commit += before.elapsed();
                self.journal_size = new_journal_size;
                self.hooks.shared.increment_commit(&self.uncommitted_hash);
                self.prepared_commit_id = None;
                debug!(
                    commit_count = self.hooks.shared.commit_count(),
                    "commit successful, releasing commit lock"
                );
                self.inside_transaction = false;
                self.uncommitted_hash.clear();
                self.uncommitted_query.clear();
                self.commit_lock_held = false;
                unsafe { self.hooks.shared.commit_lock.unlock() };
                self.query_cache.clear();
                self.hooks.shared.note_transaction_finished();

                if let Some(start_pages) = pages_before {
                    let written = engine::cache_written_pages(&self.conn) - start_pages;
                    info!(
                        pages_written = written,
                        wal_bytes = self.wal_file_size(),
                        "commit page stats"
                    );
                }

                // Keep the WAL small without blocking anyone.
                checkpoint::passive_checkpoint(&self.conn, &self.hooks.shared);

                info!(
                    queries = self.query_count,
                    cache_hits = self.cache_hits,
                    "transaction committed"
                );
                self.query_count = 0;
                self.cache_hits = 0;
                self.db_count_at_start = 0;
                Ok(CommitResult::Committed)
            }
            Err(e) if is_conflict(&e) => {
                info!("commit conflict, waiting for rollback");
                Ok(CommitResult::Conflict)
            }
            Err(e) => panic!("unexpected engine result committing transaction: {e}"),
        }
    }

    /// Everything committed on this file since the last pop, keyed by
    /// commit id.
    pub fn pop_committed_transactions(&self) -> BTreeMap<u64, TransactionInfo> {
        self.hooks.shared.pop_committed_transactions()
    }

    /// Abandon the current transaction and release every resource it
    /// holds. Idempotent: outside a transaction this only logs.
    pub fn rollback(&mut self) {
        if self.inside_transaction {
            if self.auto_rolled_back {
                info!("transaction was automatically rolled back, not sending ROLLBACK");
                self.auto_rolled_back = false;
            } else {
                if !self.uncommitted_query.is_empty() {
                    let preview: String = self.uncommitted_query.chars().take(100).collect();
                    info!(query = %preview, "rolling back transaction");
                }
                let before = Instant::now();
                if let Err(e) = engine::run_batch(&self.conn, "ROLLBACK") {
                    error!(error = %e, "ROLLBACK failed");
                }
                self.timing.rollback += before.elapsed();
            }

            self.inside_transaction = false;
            self.uncommitted_hash.clear();
            self.uncommitted_query.clear();
            if let Some(commit_id) = self.prepared_commit_id.take() {
                self.hooks.shared.discard_prepared(commit_id);
            }
            // Only release the lock when this handle took it; rollback may
            // cancel a transaction that never reached prepare.
            if self.commit_lock_held {
                self.commit_lock_held = false;
                unsafe { self.hooks.shared.commit_lock.unlock() };
            }
            self.hooks.shared.note_transaction_finished();
        } else {
            debug!("rollback outside transaction, ignoring");
        }
        self.query_cache.clear();
        debug!(
            queries = self.query_count,
            cache_hits = self.cache_hits,
            "transaction rollback"
        );
        self.query_count = 0;
        self.cache_hits = 0;
        self.db_count_at_start = 0;
        self.hooks
            .interrupt
            .checkpoint_interrupt_enabled
            .store(true, Ordering::Relaxed);
    }

    // -- interruption ----------------------------------------------------

    /// Arm a deadline for the commands that follow. The progress handler
    /// aborts the running statement once it expires, and the next read or
    /// write raises [`Error::Timeout`] carrying the elapsed time.
    pub fn start_timing(&self, limit: Duration) {
        let interrupt = &self.hooks.interrupt;
        let now = engine::now_us();
        interrupt.start_us.store(now, Ordering::Relaxed);
        interrupt.deadline_us.store(
            now.saturating_add(u64::try_from(limit.as_micros()).unwrap_or(u64::MAX)),
            Ordering::Relaxed,
        );
        interrupt.fired_elapsed_us.store(0, Ordering::Relaxed);
    }

    /// Disarm the deadline.
    pub fn reset_timing(&self) {
        let interrupt = &self.hooks.interrupt;
        interrupt.start_us.store(0, Ordering::Relaxed);
        interrupt.deadline_us.store(0, Ordering::Relaxed);
        interrupt.fired_elapsed_us.store(0, Ordering::Relaxed);
    }

    /// Block until no restart checkpoint is quiescing the database.
    /// Callers serialize their `begin`s behind the worker by calling this
    /// first; `begin` itself never blocks.
    pub fn wait_for_checkpoint(&self) {
        drop(self.hooks.shared.block_new_transactions.read());
    }

    /// Allow or forbid the checkpoint worker to interrupt this handle's
    /// current command. Re-armed to `true` on every commit or rollback.
    pub fn set_checkpoint_interrupt_enabled(&self, enabled: bool) {
        self.hooks
            .interrupt
            .checkpoint_interrupt_enabled
            .store(enabled, Ordering::Relaxed);
    }

    fn check_interrupt_errors(&mut self, operation: &str) -> Result<()> {
        let interrupt = &self.hooks.interrupt;

        // Timeout wins over checkpoint abandonment, so a command cannot
        // retry checkpoint failures forever past its own deadline.
        let mut timeout_elapsed = None;
        if interrupt.deadline_us.load(Ordering::Relaxed) != 0 {
            let now = engine::now_us();
            if now > interrupt.deadline_us.load(Ordering::Relaxed) {
                let start = interrupt.start_us.load(Ordering::Relaxed);
                interrupt
                    .fired_elapsed_us
                    .store(now.saturating_sub(start), Ordering::Relaxed);
            }
            let fired = interrupt.fired_elapsed_us.load(Ordering::Relaxed);
            if fired != 0 {
                timeout_elapsed = Some(Duration::from_micros(fired));
            }
        }
        let abandoned = interrupt
            .abandon_for_checkpoint
            .swap(false, Ordering::Relaxed);

        if (timeout_elapsed.is_some() || abandoned)
            && self.inside_transaction
            && self.conn.is_autocommit()
        {
            warn!(operation, "transaction automatically rolled back by the engine");
            self.auto_rolled_back = true;
        }

        if let Some(elapsed) = timeout_elapsed {
            self.reset_timing();
            return Err(Error::Timeout { elapsed });
        }
        if abandoned {
            return Err(Error::CheckpointRequired);
        }
        Ok(())
    }

    // -- journal reads ---------------------------------------------------

    /// The `(query, hash)` recorded for one commit id, if present.
    pub fn get_commit(&self, id: u64) -> Result<Option<(String, String)>> {
        journal::commit_record(&self.conn, &self.journal_names, id)
    }

    /// Journal rows `from..=to` (all ids from `from` when `to` is zero),
    /// in commit order, as `(id, hash, query)`.
    pub fn get_commits(&self, from: u64, to: u64) -> Result<Vec<(u64, String, String)>> {
        let mut where_clause = format!("WHERE id >= {from}");
        if to > 0 {
            where_clause.push_str(&format!(" AND id <= {to}"));
        }
        let inner = journal::union_query(
            &self.journal_names,
            &["SELECT id, hash, query FROM", &where_clause],
            false,
        );
        let full = format!("SELECT id, hash, query FROM ({inner}) ORDER BY id");
        let result = engine::query(&self.conn, &full).map_err(engine::from_engine)?;
        Ok(result
            .rows
            .into_iter()
            .map(|row| {
                (
                    match &row[0] {
                        rusqlite::types::Value::Integer(i) => u64::try_from(*i).unwrap_or(0),
                        _ => 0,
                    },
                    engine::value_to_string(&row[1]),
                    engine::value_to_string(&row[2]),
                )
            })
            .collect())
    }

    // -- policy hooks ----------------------------------------------------

    /// Enable or disable authorizer-driven query rewriting.
    pub fn enable_rewrite(&self, enable: bool) {
        self.hooks
            .auth
            .rewrite_enabled
            .store(enable, Ordering::Relaxed);
    }

    /// Install or clear the rewrite handler consulted on every statement
    /// action while rewriting is enabled.
    pub fn set_rewrite_handler(&self, handler: Option<RewriteHandler>) {
        *self.hooks.auth.handler.lock() = handler;
    }

    /// Install or clear the column whitelist. With a whitelist installed
    /// only reads of listed columns succeed; unlisted columns read as
    /// NULL and every mutation is denied.
    pub fn set_whitelist(&self, whitelist: Option<Whitelist>) {
        *self.hooks.auth.whitelist.lock() = whitelist;
    }

    /// Register a listener for restart-checkpoint notifications.
    pub fn add_checkpoint_listener(&self, listener: Weak<dyn CheckpointListener>) {
        self.hooks.shared.add_checkpoint_listener(listener);
    }

    /// Remove a previously registered checkpoint listener.
    pub fn remove_checkpoint_listener(&self, listener: &Weak<dyn CheckpointListener>) {
        self.hooks.shared.remove_checkpoint_listener(listener);
    }

    /// Toggle noop-update mode. The pragma is recorded into the
    /// uncommitted buffer when a transaction is open so followers replay
    /// the same mode switch.
    pub fn set_update_noop_mode(&mut self, enabled: bool) {
        if self.noop_update_mode == enabled {
            return;
        }
        let query = format!("PRAGMA noop_update = {};", if enabled { "ON" } else { "OFF" });
        // Patched engines understand the pragma; stock builds ignore it.
        let _ = engine::run_batch(&self.conn, &query);
        self.noop_update_mode = enabled;
        if self.inside_transaction {
            self.uncommitted_query.push_str(&query);
        }
    }

    /// Whether noop-update mode is on.
    #[must_use]
    pub fn update_noop_mode(&self) -> bool {
        self.noop_update_mode
    }

    fn wal_file_size(&self) -> u64 {
        let mut wal = self.filename.as_os_str().to_owned();
        wal.push("-wal");
        std::fs::metadata(wal).map(|m| m.len()).unwrap_or(0)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.inside_transaction {
            info!("rolling back in destructor");
            self.rollback();
        }
        debug!(db = %self.filename.display(), "closing database");
    }
}

/// Busy and busy-snapshot both signal a write-set conflict at commit.
fn is_conflict(err: &rusqlite::Error) -> bool {
    engine::extended_code(err).is_some_and(|code| (code & 0xff) == CODE_BUSY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Handle, Registry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Registry::new();
        let handle = Handle::open_in(
            OpenConfig::new(dir.path().join("unit.db")),
            &registry,
        )
        .expect("open handle");
        (dir, handle, registry)
    }

    #[test]
    fn begin_inside_transaction_is_rejected() {
        let (_dir, mut handle, _registry) = open_temp();
        handle.begin(TransactionKind::Shared).expect("begin");
        assert!(matches!(
            handle.begin(TransactionKind::Shared),
            Err(Error::NestedTransaction)
        ));
        handle.rollback();
    }

    #[test]
    fn write_requires_transaction() {
        let (_dir, mut handle, _registry) = open_temp();
        assert!(matches!(
            handle.write("CREATE TABLE t (a);"),
            Err(Error::NoActiveTransaction)
        ));
    }

    #[test]
    fn commit_requires_prepare() {
        let (_dir, mut handle, _registry) = open_temp();
        handle.begin(TransactionKind::Shared).expect("begin");
        handle.write("CREATE TABLE t (a);").expect("write");
        assert!(matches!(handle.commit(), Err(Error::NotPrepared)));
        handle.rollback();
    }

    #[test]
    fn rollback_outside_transaction_is_a_noop() {
        let (_dir, mut handle, _registry) = open_temp();
        handle.rollback();
        assert!(!handle.inside_transaction());
        assert_eq!(handle.commit_count(), 0);
    }

    #[test]
    fn full_cycle_updates_counters() {
        let (_dir, mut handle, _registry) = open_temp();
        handle.begin(TransactionKind::Exclusive).expect("begin");
        handle
            .write("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);")
            .expect("write");
        assert!(handle.prepare().expect("prepare"));
        assert_eq!(handle.commit().expect("commit"), CommitResult::Committed);
        assert_eq!(handle.commit_count(), 1);
        assert_eq!(handle.committed_hash().len(), 40);
        assert!(handle.last_transaction_timing().total() > Duration::ZERO);
    }

    #[test]
    fn duplicate_shares_state_and_rotates_journal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Registry::new();
        let mut config = OpenConfig::new(dir.path().join("dup.db"));
        config.min_journal_tables = 2;
        let handle = Handle::open_in(config, &registry).expect("open");
        assert_eq!(handle.journal_table(), "journal");

        let copies: Vec<Handle> = (0..4)
            .map(|_| handle.duplicate().expect("duplicate"))
            .collect();
        let tables: Vec<&str> = copies.iter().map(Handle::journal_table).collect();
        // Copies rotate through the suffixed tables only.
        assert!(tables.iter().all(|t| *t != "journal"));
        assert_eq!(tables[0], tables[3]);
        assert_ne!(tables[0], tables[1]);
        assert_eq!(copies[0].commit_count(), handle.commit_count());
    }
}
