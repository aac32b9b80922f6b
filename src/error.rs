use std::path::PathBuf;
use thiserror::Error as TError;

/// Top level error type returned by every fallible operation in this crate.
#[derive(Debug, TError)]
pub enum Error {
    /// A single migration failed to load: parse failure, unresolved
    /// dependency, or participation in a dependency cycle.
    ///
    /// `apply_many`/`rollback_many` catch this variant between migrations
    /// and continue with the rest of the batch; every other variant is
    /// fatal to the batch.
    #[error("bad migration at {path}: {reason}")]
    BadMigration { path: PathBuf, reason: String },

    /// Two migrations in one `MigrationSet` share an id.
    #[error("migration id {0:?} is used by more than one migration")]
    MigrationConflict(String),

    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected among {0:?}")]
    Cycle(Vec<String>),

    /// A `depends` directive names an id that isn't present in the loaded set.
    #[error("migration {migration:?} depends on unknown migration {depends_on:?}")]
    DanglingDependency {
        migration: String,
        depends_on: String,
    },

    /// Acquiring the cross-process lock exceeded its timeout.
    #[error("{0}")]
    LockTimeout(String),

    /// An underlying database driver error, tagged with the operation that
    /// was being attempted when it occurred.
    #[error("{message}: {source}")]
    Database {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// A precondition internal to the engine was violated, e.g. calling
    /// `begin` while already inside a transaction. Indicates a bug in the
    /// caller, not a runtime condition.
    #[error("usage error: {0}")]
    Usage(String),

    /// The migrations directory (or embedded source) could not be read.
    #[error("invalid migration source {path}: {source}")]
    InvalidSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn bad_migration(path: impl Into<PathBuf>, reason: impl Into<String>) -> Error {
        Error::BadMigration {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn database(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Error {
        Error::Database {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// True if this is the kind of error `apply_many`/`rollback_many` should
    /// swallow and continue past.
    pub fn is_bad_migration(&self) -> bool {
        matches!(self, Error::BadMigration { .. })
    }
}

/// Helper trait for tagging a driver-level `Result` with a message and
/// turning it into [`Error::Database`], mirroring the wrapping style used
/// throughout the step/ledger/lock code paths.
pub trait WrapDatabaseError<T> {
    fn db_err(self, message: &str) -> Result<T, Error>;
}

impl<T, E> WrapDatabaseError<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn db_err(self, message: &str) -> Result<T, Error> {
        self.map_err(|err| Error::database(message, err))
    }
}
