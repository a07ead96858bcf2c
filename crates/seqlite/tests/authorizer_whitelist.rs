//! Whitelist enforcement, query rewriting, result caching, and noop-update
//! suppression, observed through the public handle API.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use rusqlite::types::Value;
use seqlite::{CommitResult, Handle, OpenConfig, Registry, TransactionKind, Whitelist};

fn open(path: &Path, registry: &Registry) -> Handle {
    Handle::open_in(OpenConfig::new(path), registry).expect("open handle")
}

fn commit_one(handle: &mut Handle, sql: &str) {
    handle.begin(TransactionKind::Shared).expect("begin");
    handle.write(sql).expect("write");
    assert!(handle.prepare().expect("prepare"));
    assert_eq!(handle.commit().expect("commit"), CommitResult::Committed);
}

fn whitelist_id_only() -> Whitelist {
    let mut whitelist = HashMap::new();
    whitelist.insert(
        "t".to_owned(),
        ["id".to_owned()].into_iter().collect::<HashSet<_>>(),
    );
    whitelist
}

#[test]
fn whitelist_reads_pass_and_unlisted_columns_read_null() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = Registry::new();
    let mut handle = open(&dir.path().join("wl.db"), &registry);
    commit_one(
        &mut handle,
        "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);",
    );
    commit_one(&mut handle, "INSERT INTO t VALUES (1, 'secret');");

    handle.set_whitelist(Some(whitelist_id_only()));

    let ids = handle.read("SELECT id FROM t;").expect("whitelisted read");
    assert_eq!(ids.rows[0][0], Value::Integer(1));

    // Unlisted columns degrade to NULL instead of failing the query.
    let values = handle.read("SELECT v FROM t;").expect("ignored read");
    assert_eq!(values.rows[0][0], Value::Null);

    // The cache is keyed by exact text and the NULL row was cached above,
    // so the unrestricted re-read uses a distinct statement.
    handle.set_whitelist(None);
    let values = handle
        .read("SELECT v FROM t LIMIT 1;")
        .expect("unrestricted read");
    assert_eq!(values.rows[0][0], Value::Text("secret".to_owned()));
}

#[test]
fn whitelist_denies_mutation_and_transactions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = Registry::new();
    let mut handle = open(&dir.path().join("wl-deny.db"), &registry);
    commit_one(
        &mut handle,
        "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);",
    );

    // Inside an open transaction, installing the whitelist blocks writes.
    handle.begin(TransactionKind::Shared).expect("begin");
    handle.set_whitelist(Some(whitelist_id_only()));
    let denied = handle.write("INSERT INTO t VALUES (2, 'x');").unwrap_err();
    assert!(denied.is_auth_denied(), "expected auth denial, got {denied}");

    handle.set_whitelist(None);
    handle.rollback();

    // With the whitelist installed even BEGIN is refused.
    handle.set_whitelist(Some(whitelist_id_only()));
    let begin_denied = handle.begin(TransactionKind::Shared).unwrap_err();
    assert!(begin_denied.is_auth_denied());
    handle.set_whitelist(None);

    // Nothing leaked into the table.
    let count = handle
        .read_scalar("SELECT COUNT(*) FROM t;")
        .expect("count")
        .expect("value");
    assert_eq!(count, "0");
}

#[test]
fn deterministic_reads_cache_and_nondeterministic_do_not() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = Registry::new();
    let mut handle = open(&dir.path().join("cache.db"), &registry);
    commit_one(&mut handle, "CREATE TABLE t (id INTEGER PRIMARY KEY);");

    handle.begin(TransactionKind::Shared).expect("begin");

    let first = handle.read("SELECT 41 + 1;").expect("read");
    assert_eq!(handle.cache_hit_count(), 0);
    let second = handle.read("SELECT 41 + 1;").expect("read again");
    assert_eq!(handle.cache_hit_count(), 1);
    assert_eq!(first, second);

    // random() marks the query uncacheable, so repeats re-execute.
    let r1 = handle.read("SELECT random();").expect("random");
    let r2 = handle.read("SELECT random();").expect("random again");
    assert_eq!(handle.cache_hit_count(), 1);
    assert_ne!(r1.rows[0][0], r2.rows[0][0]);

    // Any write clears the cache.
    handle.write("INSERT INTO t VALUES (1);").expect("write");
    handle.read("SELECT 41 + 1;").expect("read after write");
    assert_eq!(handle.cache_hit_count(), 1);
    handle.read("SELECT 41 + 1;").expect("cached again");
    assert_eq!(handle.cache_hit_count(), 2);

    handle.rollback();
}

#[test]
fn noop_writes_stay_out_of_the_journal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = Registry::new();
    let mut handle = open(&dir.path().join("noop.db"), &registry);
    commit_one(
        &mut handle,
        "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);",
    );

    handle.begin(TransactionKind::Shared).expect("begin");
    // Matches no rows: engine state is untouched, so the statement is
    // dropped from the replication buffer.
    handle
        .write("UPDATE t SET v = 'x' WHERE id = 999;")
        .expect("noop update");
    handle
        .write("INSERT INTO t VALUES (1, 'kept');")
        .expect("real write");
    assert!(handle.prepare().expect("prepare"));
    assert_eq!(handle.commit().expect("commit"), CommitResult::Committed);

    let (query, _) = handle
        .get_commit(handle.commit_count())
        .expect("journal")
        .expect("row");
    assert_eq!(query, "INSERT INTO t VALUES (1, 'kept');");

    // write_unmodified keeps even no-ops, for replays that must preserve
    // the full script.
    handle.begin(TransactionKind::Shared).expect("begin");
    handle
        .write_unmodified("UPDATE t SET v = 'x' WHERE id = 999;")
        .expect("kept noop");
    assert!(handle.prepare().expect("prepare"));
    assert_eq!(handle.commit().expect("commit"), CommitResult::Committed);

    let (query, _) = handle
        .get_commit(handle.commit_count())
        .expect("journal")
        .expect("row");
    assert_eq!(query, "UPDATE t SET v = 'x' WHERE id = 999;");
}

#[test]
fn noop_update_mode_skips_plain_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = Registry::new();
    let mut handle = open(&dir.path().join("noop-mode.db"), &registry);
    commit_one(
        &mut handle,
        "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);",
    );

    handle.set_update_noop_mode(true);
    assert!(handle.update_noop_mode());

    handle.begin(TransactionKind::Shared).expect("begin");
    // Reported as success, but nothing executes.
    handle
        .write("INSERT INTO t VALUES (1, 'dropped');")
        .expect("skipped write");
    // The idempotent path still runs.
    handle
        .write_idempotent("INSERT INTO t VALUES (2, 'kept');")
        .expect("idempotent write");
    assert!(handle.prepare().expect("prepare"));
    assert_eq!(handle.commit().expect("commit"), CommitResult::Committed);
    handle.set_update_noop_mode(false);

    let rows = handle.read("SELECT id FROM t ORDER BY id;").expect("read");
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(rows.rows[0][0], Value::Integer(2));
}

#[test]
fn rewrite_handler_substitutes_the_statement() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = Registry::new();
    let mut handle = open(&dir.path().join("rewrite.db"), &registry);
    commit_one(
        &mut handle,
        "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);",
    );

    handle.set_rewrite_handler(Some(Box::new(|action, table, rewritten| {
        if action == rusqlite::ffi::SQLITE_INSERT && table == Some("t") {
            rewritten.push_str("INSERT INTO t VALUES (77, 'rewritten');");
            true
        } else {
            false
        }
    })));
    handle.enable_rewrite(true);

    handle.begin(TransactionKind::Shared).expect("begin");
    handle
        .write("INSERT INTO t VALUES (7, 'original');")
        .expect("rewritten write");
    assert!(handle.prepare().expect("prepare"));
    assert_eq!(handle.commit().expect("commit"), CommitResult::Committed);

    handle.enable_rewrite(false);
    handle.set_rewrite_handler(None);

    // The rewritten statement ran and is what the journal replicates.
    let ids = handle.read("SELECT id, v FROM t;").expect("read");
    assert_eq!(ids.rows.len(), 1);
    assert_eq!(ids.rows[0][0], Value::Integer(77));
    let (query, _) = handle
        .get_commit(handle.commit_count())
        .expect("journal")
        .expect("row");
    assert_eq!(query, "INSERT INTO t VALUES (77, 'rewritten');");
}
