//! Per-statement authorization policy and query rewriting.
//!
//! The engine consults the authorizer once per action while compiling a
//! statement. Three concerns stack here, in order:
//!
//! 1. Query rewriting: when enabled, the handler may store a replacement
//!    statement and the original is denied; the write path recognizes the
//!    denial code and re-executes the stored text.
//! 2. Cacheability: statements invoking non-deterministic SQL functions are
//!    flagged so the read cache never stores their results.
//! 3. Column whitelisting: with a whitelist installed, all schema and DML
//!    actions are denied, reads of unlisted columns degrade to NULL.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rusqlite::ffi;
use tracing::warn;

/// Allowed columns per table. When `None` is installed, all reads pass.
pub type Whitelist = HashMap<String, HashSet<String>>;

/// Rewrite hook: receives the authorizer action code and its first detail
/// string, and writes the replacement statement into the output buffer when
/// it returns true.
pub type RewriteHandler = Box<dyn FnMut(i32, Option<&str>, &mut String) -> bool + Send>;

/// SQL functions whose results depend on more than their arguments; any
/// query invoking one is uncacheable.
const NON_DETERMINISTIC_FUNCTIONS: &[&str] = &[
    "random",
    "date",
    "time",
    "datetime",
    "julianday",
    "strftime",
    "changes",
    "last_insert_rowid",
    "sqlite3_version",
];

/// Mutable authorizer state shared between the handle and the raw callback.
pub(crate) struct AuthorizerState {
    /// Cleared by the callback when the running query proves
    /// non-deterministic; armed true by `read` before execution.
    pub deterministic: AtomicBool,
    pub rewrite_enabled: AtomicBool,
    /// True while the rewritten text itself is executing, so the handler
    /// does not fire recursively.
    pub running_rewritten: AtomicBool,
    pub rewritten_query: Mutex<String>,
    pub handler: Mutex<Option<RewriteHandler>>,
    pub whitelist: Mutex<Option<Whitelist>>,
}

impl AuthorizerState {
    pub(crate) fn new() -> Self {
        Self {
            deterministic: AtomicBool::new(true),
            rewrite_enabled: AtomicBool::new(false),
            running_rewritten: AtomicBool::new(false),
            rewritten_query: Mutex::new(String::new()),
            handler: Mutex::new(None),
            whitelist: Mutex::new(None),
        }
    }
}

/// Decide one authorizer action. Returns the engine's `SQLITE_OK`,
/// `SQLITE_DENY`, or `SQLITE_IGNORE`.
pub(crate) fn authorize(
    state: &AuthorizerState,
    action: i32,
    detail1: Option<&str>,
    detail2: Option<&str>,
) -> i32 {
    // Rewriting first: deny the original so the write path re-executes the
    // stored replacement.
    if state.rewrite_enabled.load(Ordering::Relaxed)
        && !state.running_rewritten.load(Ordering::Relaxed)
    {
        let mut handler = state.handler.lock();
        if let Some(handler) = handler.as_mut() {
            let mut rewritten = String::new();
            if handler(action, detail1, &mut rewritten) {
                *state.rewritten_query.lock() = rewritten;
                return ffi::SQLITE_DENY;
            }
        }
    }

    if action == ffi::SQLITE_FUNCTION {
        if let Some(name) = detail2 {
            if NON_DETERMINISTIC_FUNCTIONS.contains(&name) {
                state.deterministic.store(false, Ordering::Relaxed);
            }
        }
    }

    let whitelist = state.whitelist.lock();
    let Some(whitelist) = whitelist.as_ref() else {
        return ffi::SQLITE_OK;
    };

    match action {
        // Schema mutation and DML are always denied in whitelist mode.
        ffi::SQLITE_CREATE_INDEX
        | ffi::SQLITE_CREATE_TABLE
        | ffi::SQLITE_CREATE_TEMP_INDEX
        | ffi::SQLITE_CREATE_TEMP_TABLE
        | ffi::SQLITE_CREATE_TEMP_TRIGGER
        | ffi::SQLITE_CREATE_TEMP_VIEW
        | ffi::SQLITE_CREATE_TRIGGER
        | ffi::SQLITE_CREATE_VIEW
        | ffi::SQLITE_DELETE
        | ffi::SQLITE_DROP_INDEX
        | ffi::SQLITE_DROP_TABLE
        | ffi::SQLITE_DROP_TEMP_INDEX
        | ffi::SQLITE_DROP_TEMP_TABLE
        | ffi::SQLITE_DROP_TEMP_TRIGGER
        | ffi::SQLITE_DROP_TEMP_VIEW
        | ffi::SQLITE_DROP_TRIGGER
        | ffi::SQLITE_DROP_VIEW
        | ffi::SQLITE_INSERT
        | ffi::SQLITE_TRANSACTION
        | ffi::SQLITE_UPDATE
        | ffi::SQLITE_ATTACH
        | ffi::SQLITE_DETACH
        | ffi::SQLITE_ALTER_TABLE
        | ffi::SQLITE_REINDEX
        | ffi::SQLITE_CREATE_VTABLE
        | ffi::SQLITE_DROP_VTABLE
        | ffi::SQLITE_SAVEPOINT
        | ffi::SQLITE_COPY
        | ffi::SQLITE_RECURSIVE => ffi::SQLITE_DENY,

        ffi::SQLITE_SELECT | ffi::SQLITE_ANALYZE | ffi::SQLITE_FUNCTION => ffi::SQLITE_OK,

        // The write path reads `schema_version` itself, so a bare read of
        // it must pass; assigning a value is denied (it can corrupt the
        // database).
        ffi::SQLITE_PRAGMA => {
            let pragma = detail1.map(str::to_ascii_lowercase);
            if pragma.as_deref() == Some("schema_version") && detail2.is_none() {
                ffi::SQLITE_OK
            } else {
                ffi::SQLITE_DENY
            }
        }

        ffi::SQLITE_READ => {
            let allowed = detail1
                .and_then(|table| whitelist.get(table))
                .zip(detail2)
                .is_some_and(|(columns, column)| columns.contains(column));
            if allowed {
                ffi::SQLITE_OK
            } else {
                warn!(
                    table = detail1.unwrap_or(""),
                    column = detail2.unwrap_or(""),
                    "security: read of non-whitelisted column, substituting NULL"
                );
                ffi::SQLITE_IGNORE
            }
        }

        _ => ffi::SQLITE_DENY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whitelisted_state() -> AuthorizerState {
        let state = AuthorizerState::new();
        let mut whitelist = Whitelist::new();
        whitelist.insert(
            "t".to_owned(),
            ["id".to_owned()].into_iter().collect::<HashSet<_>>(),
        );
        *state.whitelist.lock() = Some(whitelist);
        state
    }

    #[test]
    fn no_whitelist_allows_everything() {
        let state = AuthorizerState::new();
        assert_eq!(
            authorize(&state, ffi::SQLITE_INSERT, Some("t"), None),
            ffi::SQLITE_OK
        );
        assert_eq!(
            authorize(&state, ffi::SQLITE_DROP_TABLE, Some("t"), None),
            ffi::SQLITE_OK
        );
    }

    #[test]
    fn whitelist_denies_mutation() {
        let state = whitelisted_state();
        for action in [
            ffi::SQLITE_INSERT,
            ffi::SQLITE_UPDATE,
            ffi::SQLITE_DELETE,
            ffi::SQLITE_CREATE_TABLE,
            ffi::SQLITE_TRANSACTION,
            ffi::SQLITE_SAVEPOINT,
        ] {
            assert_eq!(authorize(&state, action, Some("t"), None), ffi::SQLITE_DENY);
        }
    }

    #[test]
    fn whitelist_always_allows_select_analyze_function() {
        let state = whitelisted_state();
        assert_eq!(authorize(&state, ffi::SQLITE_SELECT, None, None), ffi::SQLITE_OK);
        assert_eq!(
            authorize(&state, ffi::SQLITE_ANALYZE, Some("t"), None),
            ffi::SQLITE_OK
        );
        assert_eq!(
            authorize(&state, ffi::SQLITE_FUNCTION, None, Some("count")),
            ffi::SQLITE_OK
        );
    }

    #[test]
    fn pragma_schema_version_read_only() {
        let state = whitelisted_state();
        assert_eq!(
            authorize(&state, ffi::SQLITE_PRAGMA, Some("schema_version"), None),
            ffi::SQLITE_OK
        );
        assert_eq!(
            authorize(&state, ffi::SQLITE_PRAGMA, Some("SCHEMA_VERSION"), None),
            ffi::SQLITE_OK
        );
        // Assignment is a corruption hazard.
        assert_eq!(
            authorize(
                &state,
                ffi::SQLITE_PRAGMA,
                Some("schema_version"),
                Some("1")
            ),
            ffi::SQLITE_DENY
        );
        assert_eq!(
            authorize(&state, ffi::SQLITE_PRAGMA, Some("journal_mode"), None),
            ffi::SQLITE_DENY
        );
    }

    #[test]
    fn read_consults_whitelist() {
        let state = whitelisted_state();
        assert_eq!(
            authorize(&state, ffi::SQLITE_READ, Some("t"), Some("id")),
            ffi::SQLITE_OK
        );
        assert_eq!(
            authorize(&state, ffi::SQLITE_READ, Some("t"), Some("v")),
            ffi::SQLITE_IGNORE
        );
        assert_eq!(
            authorize(&state, ffi::SQLITE_READ, Some("other"), Some("id")),
            ffi::SQLITE_IGNORE
        );
    }

    #[test]
    fn non_deterministic_function_clears_flag() {
        let state = AuthorizerState::new();
        assert!(state.deterministic.load(Ordering::Relaxed));
        authorize(&state, ffi::SQLITE_FUNCTION, None, Some("random"));
        assert!(!state.deterministic.load(Ordering::Relaxed));

        state.deterministic.store(true, Ordering::Relaxed);
        authorize(&state, ffi::SQLITE_FUNCTION, None, Some("abs"));
        assert!(state.deterministic.load(Ordering::Relaxed));
    }

    #[test]
    fn rewrite_denies_original_and_stores_replacement() {
        let state = AuthorizerState::new();
        state.rewrite_enabled.store(true, Ordering::Relaxed);
        *state.handler.lock() = Some(Box::new(|action, _detail, out| {
            if action == ffi::SQLITE_INSERT {
                out.push_str("INSERT INTO t VALUES (99);");
                true
            } else {
                false
            }
        }));

        assert_eq!(
            authorize(&state, ffi::SQLITE_INSERT, Some("t"), None),
            ffi::SQLITE_DENY
        );
        assert_eq!(
            state.rewritten_query.lock().as_str(),
            "INSERT INTO t VALUES (99);"
        );

        // No recursion while the rewritten statement runs.
        state.running_rewritten.store(true, Ordering::Relaxed);
        assert_eq!(
            authorize(&state, ffi::SQLITE_INSERT, Some("t"), None),
            ffi::SQLITE_OK
        );
    }
}
