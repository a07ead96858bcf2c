//! Journal table management.
//!
//! Every committed transaction is recorded as `(id, query, hash)` in one of
//! a set of journal tables: the unsuffixed `journal` plus `journal0000`,
//! `journal0001`, … Handles spread their writes across tables to reduce
//! contention, and reads that need the full history union all of them.
//! Ids are globally unique across tables and strictly increase with commit
//! order.

use rusqlite::{params, Connection};
use seqlite_error::Result;
use sha1::{Digest, Sha1};
use tracing::info;

use crate::engine::{self, value_to_string};

/// Next link of the journal hash chain: lowercase hex SHA-1 of the previous
/// hash concatenated with this transaction's query text. The genesis
/// predecessor is the empty string.
#[must_use]
pub fn chain_hash(previous_hash: &str, query: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(query.as_bytes());
    hex::encode(hasher.finalize())
}

/// Journal ids are rendered with four digits, so the table count is capped
/// below ten thousand.
pub(crate) const MAX_JOURNAL_TABLES: i64 = 10_000;

/// Name for journal table `index`; `-1` is the unsuffixed primary table.
pub(crate) fn table_name(index: i64) -> String {
    if index < 0 {
        "journal".to_owned()
    } else {
        format!("journal{index:04}")
    }
}

/// Create journal tables `journal` through `journal{min:04}` if missing.
pub(crate) fn ensure_tables(conn: &Connection, min_journal_tables: i64) -> Result<()> {
    debug_assert!(min_journal_tables < MAX_JOURNAL_TABLES);
    for index in -1..=min_journal_tables {
        let name = table_name(index);
        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get::<_, i64>(0).map(|n| n > 0),
            )
            .map_err(engine::from_engine)?;
        if !exists {
            conn.execute_batch(&format!(
                "CREATE TABLE {name} ( id INTEGER PRIMARY KEY, query TEXT, hash TEXT )"
            ))
            .map_err(engine::from_engine)?;
            info!(table = %name, "created journal table");
        }
    }
    Ok(())
}

/// Discover the contiguous set of journal tables actually present, which
/// may be larger than the configured minimum.
pub(crate) fn discover_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut index = -1i64;
    loop {
        let name = table_name(index);
        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get::<_, i64>(0).map(|n| n > 0),
            )
            .map_err(engine::from_engine)?;
        if !exists {
            break;
        }
        names.push(name);
        index += 1;
    }
    Ok(names)
}

/// Compose a `UNION` over every journal table.
///
/// `parts` are interleaved with each table name; with `append` the name is
/// also appended after the final part. `union_query(&names,
/// &["SELECT MAX(id) AS id FROM"], true)` yields
/// `SELECT MAX(id) AS id FROM journal UNION SELECT ... FROM journal0000`.
pub(crate) fn union_query(journal_names: &[String], parts: &[&str], append: bool) -> String {
    let per_table: Vec<String> = journal_names
        .iter()
        .map(|name| {
            let mut q = parts.join(&format!(" {name} "));
            if append {
                q.push(' ');
                q.push_str(name);
            }
            q
        })
        .collect();
    per_table.join(" UNION ")
}

/// Highest committed id across every journal table; zero when empty.
pub(crate) fn max_id(conn: &Connection, journal_names: &[String]) -> Result<u64> {
    let inner = union_query(journal_names, &["SELECT MAX(id) AS maxIDs FROM"], true);
    let query = format!("SELECT MAX(maxIDs) FROM ({inner})");
    let id: Option<i64> = conn
        .query_row(&query, [], |row| row.get(0))
        .map_err(engine::from_engine)?;
    Ok(id.map_or(0, |v| u64::try_from(v).unwrap_or(0)))
}

/// `MAX(id) − MIN(id)` across all journal tables, the soft size measure
/// used for trimming.
pub(crate) fn journal_span(conn: &Connection, journal_names: &[String]) -> Result<u64> {
    let min_inner = union_query(journal_names, &["SELECT MIN(id) AS id FROM"], true);
    let min: Option<i64> = conn
        .query_row(&format!("SELECT MIN(id) AS id FROM ({min_inner})"), [], |row| {
            row.get(0)
        })
        .map_err(engine::from_engine)?;
    let max_inner = union_query(journal_names, &["SELECT MAX(id) AS id FROM"], true);
    let max: Option<i64> = conn
        .query_row(&format!("SELECT MAX(id) AS id FROM ({max_inner})"), [], |row| {
            row.get(0)
        })
        .map_err(engine::from_engine)?;
    Ok(u64::try_from(max.unwrap_or(0) - min.unwrap_or(0)).unwrap_or(0))
}

/// Look up the `(query, hash)` recorded for a commit id, across all tables.
pub(crate) fn commit_record(
    conn: &Connection,
    journal_names: &[String],
    id: u64,
) -> Result<Option<(String, String)>> {
    let where_clause = format!("WHERE id = {id}");
    let query = union_query(
        journal_names,
        &["SELECT query, hash FROM", &where_clause],
        false,
    );
    let result = engine::query(conn, &query).map_err(engine::from_engine)?;
    Ok(result.rows.first().map(|row| {
        (
            value_to_string(&row[0]),
            value_to_string(&row[1]),
        )
    }))
}

/// Delete up to ten of the oldest rows in `journal_name` whose id has
/// fallen more than `max_journal_size` below that table's maximum, then
/// return the table-local `MAX(id) − MIN(id)` span.
pub(crate) fn trim_oldest(
    conn: &Connection,
    journal_name: &str,
    max_journal_size: u64,
) -> Result<u64> {
    conn.execute(
        &format!(
            "DELETE FROM {journal_name} WHERE id IN ( \
             SELECT id FROM {journal_name} \
             WHERE id < (SELECT MAX(id) FROM {journal_name}) - ?1 \
             ORDER BY id LIMIT 10)"
        ),
        params![i64::try_from(max_journal_size).unwrap_or(i64::MAX)],
    )
    .map_err(engine::from_engine)?;

    let min: Option<i64> = conn
        .query_row(
            &format!("SELECT MIN(id) AS id FROM {journal_name}"),
            [],
            |row| row.get(0),
        )
        .map_err(engine::from_engine)?;
    let max: Option<i64> = conn
        .query_row(
            &format!("SELECT MAX(id) AS id FROM {journal_name}"),
            [],
            |row| row.get(0),
        )
        .map_err(engine::from_engine)?;
    Ok(u64::try_from(max.unwrap_or(0) - min.unwrap_or(0)).unwrap_or(0))
}
