//! Open-time configuration for a database handle.

use std::path::PathBuf;

use seqlite_error::{Error, Result};

/// How often (in virtual-machine steps) the engine invokes the progress
/// handler. Roughly one callback per second of execution at this setting,
/// granular enough for sub-second timeout checks.
pub const DEFAULT_PROGRESS_STEP_INTERVAL: i32 = 1_000_000;

/// Configuration for [`crate::Handle::open`].
///
/// `filename` is the only required field; the rest default to values suitable
/// for tests and small deployments. Production callers typically raise
/// `cache_size_kb` and `mmap_size_gb`.
#[derive(Debug, Clone)]
pub struct OpenConfig {
    /// Database filename, canonicalized at open. The literal `":memory:"`
    /// is passed through unchanged and is legal only with a single handle.
    pub filename: PathBuf,
    /// Page-cache size in kilobytes (the engine's negative `cache_size`
    /// convention is applied internally).
    pub cache_size_kb: i64,
    /// Soft cap on journal rows; each handle trims its own journal table
    /// past this size.
    pub max_journal_size: u64,
    /// Journal tables created at open if missing, numbered `journal0000`
    /// through `journal{N:04}`, in addition to the unsuffixed `journal`.
    pub min_journal_tables: i64,
    /// Value for `PRAGMA synchronous`; `None` keeps the engine default.
    pub synchronous: Option<String>,
    /// Memory-map size in gigabytes; zero disables memory-mapped I/O.
    pub mmap_size_gb: i64,
    /// Log page-write counts and WAL size on every commit.
    pub page_logging: bool,
    /// Progress-handler granularity in VM steps.
    pub progress_step_interval: i32,
}

impl OpenConfig {
    /// Configuration with defaults for the given filename.
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            cache_size_kb: 10_000,
            max_journal_size: 1_000_000,
            min_journal_tables: 0,
            synchronous: None,
            mmap_size_gb: 0,
            page_logging: false,
            progress_step_interval: DEFAULT_PROGRESS_STEP_INTERVAL,
        }
    }

    /// Sanity-check field values before opening.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.filename.as_os_str().is_empty() {
            return Err(Error::InvalidFilename {
                path: self.filename.clone(),
            });
        }
        if self.cache_size_kb <= 0 {
            return Err(Error::InvalidConfig("cache_size_kb must be positive".into()));
        }
        if self.max_journal_size == 0 {
            return Err(Error::InvalidConfig("max_journal_size must be positive".into()));
        }
        if !(0..10_000).contains(&self.min_journal_tables) {
            return Err(Error::InvalidConfig("min_journal_tables out of range".into()));
        }
        if self.progress_step_interval <= 0 {
            return Err(Error::InvalidConfig(
                "progress_step_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(OpenConfig::new("/tmp/db.sq3").validate().is_ok());
    }

    #[test]
    fn rejects_empty_filename() {
        let cfg = OpenConfig::new("");
        assert!(matches!(
            cfg.validate(),
            Err(Error::InvalidFilename { .. })
        ));
    }

    #[test]
    fn rejects_zero_journal_size() {
        let mut cfg = OpenConfig::new("/tmp/db.sq3");
        cfg.max_journal_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unnameable_journal_count() {
        let mut cfg = OpenConfig::new("/tmp/db.sq3");
        cfg.min_journal_tables = 10_000;
        assert!(cfg.validate().is_err());
    }
}
