//! Engine opener and raw hook plumbing.
//!
//! Everything that touches `rusqlite` or the raw C API lives here:
//!
//! - [`open_connection`]: open/create the file and apply the pragma sequence.
//! - [`install_hooks`]: register the WAL, authorizer, and progress callbacks.
//! - [`query`] / [`run_batch`]: statement execution returning [`QueryResult`].
//! - checkpoint and status primitives (`sqlite3_wal_checkpoint_v2`,
//!   `sqlite3_db_status`, `sqlite3_total_changes`).
//!
//! The split is intentional: this module performs engine calls only, while
//! `checkpoint.rs` and `authorizer.rs` hold the policy those callbacks apply.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::ffi;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use seqlite_error::{Error, Result};
use tracing::{debug, info};

use crate::authorizer::AuthorizerState;
use crate::config::OpenConfig;
use crate::registry::MEMORY_FILENAME;
use crate::shared::SharedState;

// ---------------------------------------------------------------------------
// Query results
// ---------------------------------------------------------------------------

/// Full result of a read query: column names plus every row, owned.
///
/// Rows hold engine values; [`QueryResult::scalar`] renders the first cell
/// as text for callers that follow the one-value convention.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    /// The first cell of the first row as text, if present.
    #[must_use]
    pub fn scalar(&self) -> Option<String> {
        self.rows.first().and_then(|r| r.first()).map(value_to_string)
    }

    /// Whether the result has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Render an engine value the way journal queries expect: NULL is the empty
/// string, blobs are lowercase hex.
#[must_use]
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => hex::encode(b),
    }
}

// ---------------------------------------------------------------------------
// Hook state
// ---------------------------------------------------------------------------

/// Flags the progress handler reads and sets while a statement runs.
///
/// The handler fires re-entrantly inside engine calls on the handle's own
/// thread, so every field is atomic; the handle reads them afterwards in
/// `check_interrupt_errors`.
#[derive(Debug)]
pub(crate) struct InterruptState {
    /// Microsecond timestamp when `start_timing` armed the deadline.
    pub start_us: AtomicU64,
    /// Absolute deadline in microseconds; zero means no deadline armed.
    pub deadline_us: AtomicU64,
    /// Elapsed time latched by the progress handler when the deadline fired.
    pub fired_elapsed_us: AtomicU64,
    /// Set by the progress handler when a restart checkpoint wants this
    /// transaction abandoned.
    pub abandon_for_checkpoint: AtomicBool,
    /// Re-armed true on every commit/rollback; commands that must not be
    /// interrupted clear it for the duration of the command.
    pub checkpoint_interrupt_enabled: AtomicBool,
}

impl InterruptState {
    pub(crate) fn new() -> Self {
        Self {
            start_us: AtomicU64::new(0),
            deadline_us: AtomicU64::new(0),
            fired_elapsed_us: AtomicU64::new(0),
            abandon_for_checkpoint: AtomicBool::new(false),
            checkpoint_interrupt_enabled: AtomicBool::new(true),
        }
    }
}

/// Per-handle state shared with the raw engine callbacks.
///
/// A `Box<HookState>` is owned by the handle and its address is registered
/// as the user-data pointer for all three hooks. The handle declares its
/// connection field before this one, so the connection (and with it every
/// registered callback) is torn down before the box is freed.
pub(crate) struct HookState {
    pub shared: Arc<SharedState>,
    pub interrupt: InterruptState,
    pub auth: AuthorizerState,
    pub filename: PathBuf,
}

// ---------------------------------------------------------------------------
// Open + pragma sequence
// ---------------------------------------------------------------------------

fn trace_statement(sql: &str) {
    if crate::statement_trace_enabled() {
        info!(target: "seqlite::trace", sql, "statement");
    }
}

/// Open (or create) the database read-write with no internal engine mutex;
/// the handle guarantees one thread at a time. Applies the open-time pragma
/// sequence in order: legacy file format off, WAL journaling, optional
/// memory-mapping, cache size, optional synchronous override.
pub(crate) fn open_connection(path: &Path, config: &OpenConfig) -> Result<Connection> {
    let creating = path != Path::new(MEMORY_FILENAME) && !path.exists();
    info!(
        db = %path.display(),
        action = if creating { "creating" } else { "opening" },
        "database"
    );

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let mut conn = Connection::open_with_flags(path, flags).map_err(from_engine)?;
    conn.trace(Some(trace_statement));

    // Sets the default for newly created databases; must run before any
    // table exists to take effect.
    conn.execute_batch("PRAGMA legacy_file_format = OFF;")
        .map_err(from_engine)?;

    let mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .map_err(from_engine)?;
    debug!(db = %path.display(), journal_mode = %mode, "journaling enabled");

    if config.mmap_size_gb > 0 {
        let bytes = config.mmap_size_gb * 1024 * 1024 * 1024;
        let _applied: i64 = conn
            .query_row(&format!("PRAGMA mmap_size = {bytes}"), [], |row| row.get(0))
            .map_err(from_engine)?;
    }

    info!(cache_size_kb = config.cache_size_kb, "setting cache size");
    conn.execute_batch(&format!("PRAGMA cache_size = -{};", config.cache_size_kb))
        .map_err(from_engine)?;

    match &config.synchronous {
        Some(level) => conn
            .execute_batch(&format!("PRAGMA synchronous = {level};"))
            .map_err(from_engine)?,
        None => debug!(db = %path.display(), "using engine default synchronous"),
    }

    Ok(conn)
}

/// Register the WAL, authorizer, and progress callbacks against `state`.
///
/// Safety contract: `state` must stay at a stable address for the lifetime
/// of `conn` (the handle keeps it boxed and drops the connection first).
pub(crate) fn install_hooks(conn: &Connection, state: &HookState, progress_interval: i32) {
    let raw = (state as *const HookState).cast_mut().cast::<c_void>();
    unsafe {
        let db = conn.handle();
        ffi::sqlite3_wal_hook(db, Some(wal_callback), raw);
        ffi::sqlite3_set_authorizer(db, Some(authorizer_callback), raw);
        ffi::sqlite3_progress_handler(db, progress_interval, Some(progress_callback), raw);
    }
}

/// Whether this engine build understands `BEGIN CONCURRENT` (the optimistic
/// concurrent-writer branch). Stock builds reject the syntax; the handle
/// then falls back to plain `BEGIN`.
pub(crate) fn probe_begin_concurrent(conn: &Connection) -> bool {
    match conn.execute_batch("BEGIN CONCURRENT") {
        Ok(()) => {
            let _ = conn.execute_batch("ROLLBACK");
            true
        }
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Raw callbacks
// ---------------------------------------------------------------------------

unsafe fn opt_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        None
    } else {
        CStr::from_ptr(ptr).to_str().ok()
    }
}

unsafe extern "C" fn wal_callback(
    arg: *mut c_void,
    _db: *mut ffi::sqlite3,
    db_name: *const c_char,
    page_count: c_int,
) -> c_int {
    let state = &*arg.cast_const().cast::<HookState>();
    let name = opt_str(db_name).unwrap_or("main");
    crate::checkpoint::on_wal_grew(&state.shared, &state.filename, name, page_count);
    ffi::SQLITE_OK
}

unsafe extern "C" fn progress_callback(arg: *mut c_void) -> c_int {
    let state = &*arg.cast_const().cast::<HookState>();
    let interrupt = &state.interrupt;

    let deadline = interrupt.deadline_us.load(Ordering::Relaxed);
    if deadline != 0 && now_us() > deadline {
        let start = interrupt.start_us.load(Ordering::Relaxed);
        interrupt
            .fired_elapsed_us
            .store(now_us().saturating_sub(start), Ordering::Relaxed);
        // Non-zero aborts the running statement; the handle converts the
        // latched flag into a timeout failure at the next read/write edge.
        return 1;
    }

    if state.shared.checkpoint_thread_busy() {
        if interrupt.checkpoint_interrupt_enabled.load(Ordering::Relaxed) {
            info!("abandoning transaction to unblock checkpoint");
            interrupt.abandon_for_checkpoint.store(true, Ordering::Relaxed);
            return 2;
        }
        debug!("checkpoint pending but interrupt disabled for this command");
    }
    0
}

unsafe extern "C" fn authorizer_callback(
    arg: *mut c_void,
    action: c_int,
    detail1: *const c_char,
    detail2: *const c_char,
    _detail3: *const c_char,
    _detail4: *const c_char,
) -> c_int {
    let state = &*arg.cast_const().cast::<HookState>();
    crate::authorizer::authorize(&state.auth, action, opt_str(detail1), opt_str(detail2))
}

// ---------------------------------------------------------------------------
// Statement execution
// ---------------------------------------------------------------------------

/// Execute a read query and collect the full result set.
pub(crate) fn query(conn: &Connection, sql: &str) -> rusqlite::Result<QueryResult> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| (*c).to_owned()).collect();
    let column_count = stmt.column_count();

    let mut rows = stmt.query([])?;
    let mut collected = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Vec::with_capacity(column_count);
        for i in 0..column_count {
            record.push(row.get::<_, Value>(i)?);
        }
        collected.push(record);
    }
    Ok(QueryResult {
        columns,
        rows: collected,
    })
}

/// Execute one or more statements, discarding any rows they produce.
pub(crate) fn run_batch(conn: &Connection, sql: &str) -> rusqlite::Result<()> {
    conn.execute_batch(sql)
}

/// The engine's extended result code behind a rusqlite error, if any.
pub(crate) fn extended_code(err: &rusqlite::Error) -> Option<i32> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => Some(e.extended_code),
        _ => None,
    }
}

/// Convert a rusqlite error into the crate error, preserving the code.
pub(crate) fn from_engine(err: rusqlite::Error) -> Error {
    let code = extended_code(&err).unwrap_or(-1);
    Error::engine(code, err.to_string())
}

// ---------------------------------------------------------------------------
// Status primitives
// ---------------------------------------------------------------------------

/// `PRAGMA schema_version` as a plain integer.
pub(crate) fn schema_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("PRAGMA schema_version;", [], |row| row.get(0))
}

/// Total rows changed since the connection opened (`sqlite3_total_changes`).
pub(crate) fn total_changes(conn: &Connection) -> i64 {
    unsafe { i64::from(ffi::sqlite3_total_changes(conn.handle())) }
}

/// Pages written to the page cache so far (`SQLITE_DBSTATUS_CACHE_WRITE`).
pub(crate) fn cache_written_pages(conn: &Connection) -> i32 {
    let mut current: c_int = 0;
    let mut highwater: c_int = 0;
    let rc = unsafe {
        ffi::sqlite3_db_status(
            conn.handle(),
            ffi::SQLITE_DBSTATUS_CACHE_WRITE,
            &mut current,
            &mut highwater,
            0,
        )
    };
    if rc == ffi::SQLITE_OK {
        current
    } else {
        0
    }
}

/// WAL checkpoint flavors the coordinator drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WalCheckpointMode {
    /// Backfill what it can without blocking anyone.
    Passive,
    /// Block new readers from the old WAL and reset it.
    Restart,
}

/// Run `sqlite3_wal_checkpoint_v2`; returns (result code, WAL frames,
/// frames checkpointed).
pub(crate) fn wal_checkpoint(conn: &Connection, mode: WalCheckpointMode) -> (i32, i32, i32) {
    let flag = match mode {
        WalCheckpointMode::Passive => ffi::SQLITE_CHECKPOINT_PASSIVE,
        WalCheckpointMode::Restart => ffi::SQLITE_CHECKPOINT_RESTART,
    };
    let mut wal_frames: c_int = 0;
    let mut backfilled: c_int = 0;
    let rc = unsafe {
        ffi::sqlite3_wal_checkpoint_v2(
            conn.handle(),
            std::ptr::null(),
            flag,
            &mut wal_frames,
            &mut backfilled,
        )
    };
    (rc, wal_frames, backfilled)
}

/// Microseconds since the Unix epoch; the clock behind timeouts.
pub(crate) fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_renders_first_cell() {
        let result = QueryResult {
            columns: vec!["n".to_owned()],
            rows: vec![vec![Value::Integer(7)], vec![Value::Integer(8)]],
        };
        assert_eq!(result.scalar().as_deref(), Some("7"));
        assert!(!result.is_empty());
        assert!(QueryResult::default().scalar().is_none());
    }

    #[test]
    fn value_rendering() {
        assert_eq!(value_to_string(&Value::Null), "");
        assert_eq!(value_to_string(&Value::Text("x".to_owned())), "x");
        assert_eq!(value_to_string(&Value::Blob(vec![0xab, 0x01])), "ab01");
    }

    #[test]
    fn query_collects_all_rows() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (a, b); INSERT INTO t VALUES (1, 'x'), (2, 'y');")
            .expect("setup");
        let result = query(&conn, "SELECT a, b FROM t ORDER BY a").expect("query");
        assert_eq!(result.columns, vec!["a", "b"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[1][1], Value::Text("y".to_owned()));
    }

    #[test]
    fn extended_code_surfaces_engine_failures() {
        let conn = Connection::open_in_memory().expect("open");
        let err = conn.execute_batch("SELECT * FROM missing").unwrap_err();
        assert!(extended_code(&err).is_some());
        let mapped = from_engine(err);
        assert!(mapped.code().is_some());
    }

    #[test]
    fn total_changes_counts_inserts() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (a);").expect("ddl");
        let before = total_changes(&conn);
        conn.execute_batch("INSERT INTO t VALUES (1);").expect("dml");
        assert_eq!(total_changes(&conn), before + 1);
    }
}
