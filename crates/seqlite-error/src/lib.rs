use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Primary error type for seqlite operations.
///
/// Structured variants for the cases callers are expected to branch on
/// (timeouts and checkpoint interruptions must be handled differently from
/// plain engine failures), plus a raw [`Error::Engine`] variant that carries
/// the engine's extended result code for everything else.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-armed deadline expired while the engine was executing.
    ///
    /// Carries the elapsed time between `start_timing` and the moment the
    /// progress handler observed the expired deadline. The caller must roll
    /// back the current transaction.
    #[error("operation timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// A restart checkpoint is waiting on this transaction.
    ///
    /// The caller must roll back and retry once the checkpoint completes.
    #[error("transaction abandoned: checkpoint required")]
    CheckpointRequired,

    /// Cannot begin a transaction while one is already open on this handle.
    #[error("cannot start a transaction within a transaction")]
    NestedTransaction,

    /// The operation requires an open transaction.
    #[error("no transaction is active")]
    NoActiveTransaction,

    /// Commit was called before prepare.
    #[error("cannot commit - transaction was not prepared")]
    NotPrepared,

    /// The database filename could not be canonicalized.
    #[error("could not resolve database path: '{path}'")]
    InvalidFilename { path: PathBuf },

    /// An open-time configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An engine-level failure, with the extended result code when known.
    #[error("engine error (code {code}): {message}")]
    Engine { code: i32, message: String },

    /// File I/O error outside the engine.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine primary result code for "database is busy".
pub const CODE_BUSY: i32 = 5;
/// Extended result code for a write-set conflict detected at commit.
pub const CODE_BUSY_SNAPSHOT: i32 = 5 | (2 << 8);
/// Primary result code for an authorizer denial.
pub const CODE_AUTH: i32 = 23;
/// Primary result code for an interrupted statement.
pub const CODE_INTERRUPT: i32 = 9;

impl Error {
    /// Create an engine error from a raw result code and message.
    pub fn engine(code: i32, message: impl Into<String>) -> Self {
        Self::Engine {
            code,
            message: message.into(),
        }
    }

    /// The engine result code behind this error, if any.
    #[must_use]
    pub const fn code(&self) -> Option<i32> {
        match self {
            Self::Engine { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether retrying the whole transaction may succeed.
    ///
    /// Busy/conflict engine errors and checkpoint interruptions are
    /// transient; timeouts are not (the caller chose the budget).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::CheckpointRequired => true,
            Self::Engine { code, .. } => (*code & 0xff) == CODE_BUSY,
            _ => false,
        }
    }

    /// Whether this error came from an authorizer denial.
    #[must_use]
    pub const fn is_auth_denied(&self) -> bool {
        matches!(self, Self::Engine { code, .. } if (*code & 0xff) == CODE_AUTH)
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
