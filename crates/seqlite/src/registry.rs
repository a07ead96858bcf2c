//! Path resolver and shared-state registry.
//!
//! Handles referencing the same database file must coordinate through one
//! [`SharedState`], discovered here by canonicalized filesystem path. The
//! registry is an explicit value so tests can construct isolated instances;
//! [`Registry::global`] serves callers that want the process-wide singleton.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rusqlite::Connection;
use seqlite_error::{Error, Result};
use tracing::debug;

use crate::journal;
use crate::shared::SharedState;

/// The engine's in-memory database name, passed through unresolved.
///
/// Memory databases are legal only with a single handle: every handle on
/// `":memory:"` gets its own private database, yet they would share one
/// registry entry.
pub const MEMORY_FILENAME: &str = ":memory:";

/// Canonicalize a database filename; the canonical path keys the registry.
pub fn resolve_filename(filename: &Path) -> Result<PathBuf> {
    if filename == Path::new(MEMORY_FILENAME) {
        return Ok(filename.to_path_buf());
    }
    // The file may not exist yet; canonicalize the parent and re-attach the
    // final component.
    match std::fs::canonicalize(filename) {
        Ok(path) => Ok(path),
        Err(_) => {
            let parent = filename.parent().filter(|p| !p.as_os_str().is_empty());
            let name = filename.file_name().ok_or_else(|| Error::InvalidFilename {
                path: filename.to_path_buf(),
            })?;
            let parent = match parent {
                Some(p) => std::fs::canonicalize(p).map_err(|_| Error::InvalidFilename {
                    path: filename.to_path_buf(),
                })?,
                None => std::env::current_dir()?,
            };
            Ok(parent.join(name))
        }
    }
}

/// Process-wide mapping from canonical path to [`SharedState`].
#[derive(Default)]
pub struct Registry {
    states: Mutex<HashMap<PathBuf, Arc<SharedState>>>,
}

impl Registry {
    /// An empty registry, independent of the global one.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by [`crate::Handle::open`].
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    /// Shared state for `path`, creating and seeding it on first touch.
    ///
    /// Seeding reads the highest journal id and its hash through `conn`.
    ///
    /// # Panics
    ///
    /// A populated journal whose head row has no hash means the chain
    /// invariant is already broken on disk; that is unrecoverable here.
    pub(crate) fn shared_for(
        &self,
        conn: &Connection,
        path: &Path,
        journal_names: &[String],
    ) -> Result<Arc<SharedState>> {
        let mut states = self.states.lock();
        if let Some(existing) = states.get(path) {
            return Ok(Arc::clone(existing));
        }

        let commit_count = journal::max_id(conn, journal_names)?;
        let last_committed_hash = journal::commit_record(conn, journal_names, commit_count)?
            .map(|(_, hash)| hash)
            .unwrap_or_default();
        if commit_count > 0 && last_committed_hash.is_empty() {
            panic!("loaded commit count {commit_count} with empty hash");
        }
        debug!(
            db = %path.display(),
            commit_count,
            "seeded shared state from journal"
        );

        let shared = Arc::new(SharedState::new(commit_count, last_committed_hash));
        states.insert(path.to_path_buf(), Arc::clone(&shared));
        Ok(shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_filename_passes_through() {
        let resolved = resolve_filename(Path::new(MEMORY_FILENAME)).expect("resolve");
        assert_eq!(resolved, Path::new(MEMORY_FILENAME));
    }

    #[test]
    fn nonexistent_file_resolves_through_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fresh.db");
        let resolved = resolve_filename(&path).expect("resolve");
        assert!(resolved.is_absolute());
        assert_eq!(resolved.file_name().unwrap(), "fresh.db");
    }

    #[test]
    fn same_path_yields_same_shared_state() {
        let registry = Registry::new();
        let conn = Connection::open_in_memory().expect("open");
        journal::ensure_tables(&conn, 0).expect("tables");
        let names = journal::discover_tables(&conn).expect("discover");

        let key = PathBuf::from("/fake/key");
        let a = registry.shared_for(&conn, &key, &names).expect("first");
        let b = registry.shared_for(&conn, &key, &names).expect("second");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn seeds_counters_from_existing_journal() {
        let registry = Registry::new();
        let conn = Connection::open_in_memory().expect("open");
        journal::ensure_tables(&conn, 0).expect("tables");
        let names = journal::discover_tables(&conn).expect("discover");
        conn.execute_batch(
            "INSERT INTO journal VALUES (1, 'q1', 'h1');
             INSERT INTO journal0000 VALUES (2, 'q2', 'h2');",
        )
        .expect("seed");

        let shared = registry
            .shared_for(&conn, Path::new("/fake/seeded"), &names)
            .expect("shared");
        assert_eq!(shared.commit_count(), 2);
        assert_eq!(shared.last_committed_hash(), "h2");
    }
}
