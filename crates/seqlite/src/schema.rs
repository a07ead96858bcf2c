//! Schema verification helpers.
//!
//! Pass-through conveniences that compare a table or index against the DDL
//! recorded in the engine's master catalog, creating it when absent. All of
//! them route through [`Handle::write`] and take part in the current
//! transaction; there is no automatic migration on mismatch.

use seqlite_error::Result;
use tracing::{info, warn};

use crate::engine::value_to_string;
use crate::handle::Handle;

/// Outcome of a schema verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaCheck {
    /// The object did not exist and was created to spec.
    Created,
    /// The object exists with the expected definition.
    Matches,
    /// The object exists with a different definition; upgrade needed.
    Mismatch,
    /// The object does not exist and creation was not requested.
    Missing,
}

/// Collapse runs of whitespace to single spaces.
fn collapse(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace-insensitive comparison of two DDL strings.
fn same_ddl(a: &str, b: &str, ignore_case: bool) -> bool {
    let strip = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
    if ignore_case {
        strip(a).eq_ignore_ascii_case(&strip(b))
    } else {
        strip(a) == strip(b)
    }
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

impl Handle {
    /// Ensure `table_name` exists with exactly `sql` as its definition.
    ///
    /// `sql` must not carry a trailing semicolon; the engine trims it from
    /// the catalog copy and the comparison would never match.
    pub fn verify_table(&mut self, table_name: &str, sql: &str) -> Result<SchemaCheck> {
        debug_assert!(!sql.trim_end().ends_with(';'));
        let recorded = self.read(&format!(
            "SELECT sql FROM sqlite_master WHERE type='table' AND tbl_name={};",
            quote(table_name)
        ))?;
        let collapsed = collapse(sql);
        match recorded.rows.first().and_then(|row| row.first()) {
            None => {
                info!(table = table_name, sql = %collapsed, "creating table");
                self.write(&format!("{collapsed};"))?;
                Ok(SchemaCheck::Created)
            }
            Some(stored) => {
                let stored = collapse(&value_to_string(stored));
                if same_ddl(&stored, &collapsed, false) {
                    info!(table = table_name, "table already exists with correct schema");
                    Ok(SchemaCheck::Matches)
                } else {
                    warn!(
                        table = table_name,
                        found = %stored,
                        expected = %collapsed,
                        "table has incorrect schema, needs upgrade?"
                    );
                    Ok(SchemaCheck::Mismatch)
                }
            }
        }
    }

    /// Ensure `index_name` exists on `table_name` with the given
    /// definition (the part after `ON <table>`).
    pub fn verify_index(
        &mut self,
        index_name: &str,
        table_name: &str,
        definition: &str,
        unique: bool,
        create_if_missing: bool,
    ) -> Result<SchemaCheck> {
        info!(index = index_name, unique, "verifying index");
        let recorded = self.read(&format!(
            "SELECT sql FROM sqlite_master WHERE type='index' AND tbl_name={} AND name={};",
            quote(table_name),
            quote(index_name)
        ))?;
        let create_sql = format!(
            "CREATE{}INDEX {index_name} ON {table_name} {definition}",
            if unique { " UNIQUE " } else { " " }
        );
        match recorded.rows.first().and_then(|row| row.first()) {
            None => {
                if !create_if_missing {
                    info!(index = index_name, table = table_name, "index does not exist");
                    return Ok(SchemaCheck::Missing);
                }
                info!(index = index_name, table = table_name, sql = %create_sql, "creating index");
                self.write(&format!("{create_sql};"))?;
                Ok(SchemaCheck::Created)
            }
            Some(stored) => {
                if same_ddl(&value_to_string(stored), &create_sql, true) {
                    Ok(SchemaCheck::Matches)
                } else {
                    Ok(SchemaCheck::Mismatch)
                }
            }
        }
    }

    /// Add `column` to `table_name` unless the recorded DDL already
    /// mentions it. Returns whether a column was added.
    pub fn add_column(&mut self, table_name: &str, column: &str, column_type: &str) -> Result<bool> {
        let recorded = self.read_scalar(&format!(
            "SELECT sql FROM sqlite_master WHERE type='table' AND tbl_name={};",
            quote(table_name)
        ))?;
        let sql = collapse(&recorded.unwrap_or_default());
        if sql.contains(&format!(" {column} ")) {
            return Ok(false);
        }
        info!(table = table_name, column, column_type, "adding column");
        self.write(&format!(
            "ALTER TABLE {table_name} ADD COLUMN {column} {column_type};"
        ))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenConfig;
    use crate::handle::{CommitResult, TransactionKind};
    use crate::registry::Registry;

    fn open_temp() -> (tempfile::TempDir, Handle) {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Registry::new();
        let handle = Handle::open_in(OpenConfig::new(dir.path().join("schema.db")), &registry)
            .expect("open handle");
        (dir, handle)
    }

    const DDL: &str = "CREATE TABLE people ( id INTEGER PRIMARY KEY, name TEXT )";

    #[test]
    fn verify_table_creates_then_matches() {
        let (_dir, mut handle) = open_temp();
        handle.begin(TransactionKind::Shared).expect("begin");
        assert_eq!(handle.verify_table("people", DDL).expect("verify"), SchemaCheck::Created);
        assert!(handle.prepare().expect("prepare"));
        assert_eq!(handle.commit().expect("commit"), CommitResult::Committed);

        handle.begin(TransactionKind::Shared).expect("begin");
        // Different whitespace still matches.
        assert_eq!(
            handle
                .verify_table("people", "CREATE TABLE people (id INTEGER PRIMARY KEY,  name TEXT)")
                .expect("verify"),
            SchemaCheck::Matches
        );
        assert_eq!(
            handle
                .verify_table("people", "CREATE TABLE people ( id INTEGER PRIMARY KEY )")
                .expect("verify"),
            SchemaCheck::Mismatch
        );
        handle.rollback();
    }

    #[test]
    fn verify_index_lifecycle() {
        let (_dir, mut handle) = open_temp();
        handle.begin(TransactionKind::Shared).expect("begin");
        handle.verify_table("people", DDL).expect("table");
        assert_eq!(
            handle
                .verify_index("people_name", "people", "( name )", false, false)
                .expect("verify"),
            SchemaCheck::Missing
        );
        assert_eq!(
            handle
                .verify_index("people_name", "people", "( name )", false, true)
                .expect("verify"),
            SchemaCheck::Created
        );
        assert_eq!(
            handle
                .verify_index("people_name", "people", "( name )", false, true)
                .expect("verify"),
            SchemaCheck::Matches
        );
        assert_eq!(
            handle
                .verify_index("people_name", "people", "( id )", false, true)
                .expect("verify"),
            SchemaCheck::Mismatch
        );
        handle.rollback();
    }

    #[test]
    fn add_column_is_idempotent() {
        let (_dir, mut handle) = open_temp();
        handle.begin(TransactionKind::Shared).expect("begin");
        handle.verify_table("people", DDL).expect("table");
        assert!(handle.add_column("people", "age", "INTEGER").expect("add"));
        assert!(!handle.add_column("people", "age", "INTEGER").expect("re-add"));
        assert!(!handle.add_column("people", "name", "TEXT").expect("existing"));
        handle.rollback();
    }
}
