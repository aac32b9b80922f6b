//! Backend adapter contract: the seam between the engine and a concrete SQL
//! dialect/driver.
//!
//! The engine never talks SQL directly to a driver crate; every
//! ledger write, lock operation, and migration step goes through a
//! [`BackendAdapter`]. The only adapter shipped here is [`sqlite`], built on
//! `rusqlite`, so the rest of the crate can be exercised end to end without
//! an external database process.

#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::error::Error;
use crate::value::{QueryResult, Value};

/// Hides dialect differences (transaction semantics, identifier quoting,
/// parameter style) behind one contract the engine, ledger, and lock
/// manager share.
///
/// Implementations own a single live connection. [`BackendAdapter::copy`]
/// returns an independent adapter against the same URI with its own
/// connection, so that a migration's steps never share a connection with
/// ledger bookkeeping.
pub trait BackendAdapter: Send {
    /// Execute one statement. `params` are `:name`-style; the adapter
    /// translates them into its driver's native bind style.
    fn execute(&mut self, sql: &str, params: &HashMap<String, Value>) -> Result<QueryResult, Error>;

    /// Commit the current top-level transaction. Clears the in-transaction
    /// flag and re-runs any session-initialization hook.
    fn commit(&mut self) -> Result<(), Error>;

    /// Roll back the current top-level transaction. Re-initializes the
    /// connection afterwards (session-level settings don't survive a
    /// rollback on some dialects) and clears the in-transaction flag.
    fn rollback(&mut self) -> Result<(), Error>;

    /// Start a top-level transaction. Usage error if one is already open.
    fn begin(&mut self) -> Result<(), Error>;

    fn in_transaction(&self) -> bool;

    fn savepoint(&mut self, id: &str) -> Result<(), Error>;
    fn savepoint_release(&mut self, id: &str) -> Result<(), Error>;
    fn savepoint_rollback(&mut self, id: &str) -> Result<(), Error>;

    /// Tables in the current schema, used by tests to assert migrations ran.
    fn list_tables(&mut self) -> Result<Vec<String>, Error>;

    /// Whether DDL on this backend participates in the enclosing
    /// transaction (and is therefore undone by a rollback). Detected once
    /// per URI and cached process-wide by the caller (see
    /// [`has_transactional_ddl_cached`]); implementations just report the
    /// dialect's known behavior or run the detection probe.
    fn has_transactional_ddl(&mut self) -> Result<bool, Error>;

    /// The connection URI this adapter was opened against, used as the
    /// cache key for [`has_transactional_ddl_cached`].
    fn uri(&self) -> &str;

    /// Double-quote `s`, doubling any embedded quote. Rejects identifiers
    /// containing a NUL byte.
    fn quote_identifier(&self, s: &str) -> Result<String, Error> {
        if s.contains('\0') {
            return Err(Error::Usage(format!("identifier {s:?} contains a NUL byte")));
        }
        Ok(format!("\"{}\"", s.replace('"', "\"\"")))
    }

    /// Open an independent adapter against the same URI, with its own
    /// connection. Not part of the object-safe surface: the engine is
    /// generic over a concrete backend type and needs the concrete type
    /// back, not an erased trait object.
    fn copy(&self) -> Result<Self, Error>
    where
        Self: Sized;

    /// True if this process already holds the cross-process lock on this
    /// adapter instance (re-entrancy tracking for [`lock`](Self::acquire_lock)).
    fn lock_held(&self) -> bool;
    fn set_lock_held(&mut self, held: bool);

    /// Create the lock table if it doesn't exist yet. Idempotent; swallows
    /// errors caused by a concurrent creator.
    fn ensure_lock_table(&mut self, table: &str) -> Result<(), Error>;

    fn lock_table_insert(&mut self, table: &str, pid: u32) -> Result<bool, Error>;
    fn lock_table_delete(&mut self, table: &str, pid: u32) -> Result<(), Error>;
    fn lock_table_holder_pid(&mut self, table: &str) -> Result<Option<u32>, Error>;
    fn lock_table_truncate(&mut self, table: &str) -> Result<(), Error>;
}

/// RAII guard returned by [`transaction`]; rolls back on drop unless
/// [`TransactionScope::finish`] has been called.
///
/// Mirrors the source's context-manager: on scope exit, if an error
/// occurred roll back; else if `rollback_on_exit` was requested roll back;
/// else commit a top-level transaction or release a savepoint (a
/// savepoint's "commit" is a no-op once opened via `SAVEPOINT`, since DDL on
/// some dialects implicitly releases all savepoints).
pub struct TransactionScope<'a> {
    backend: &'a mut dyn BackendAdapter,
    savepoint_id: Option<String>,
    rollback_on_exit: bool,
    finished: bool,
}

impl<'a> TransactionScope<'a> {
    /// Open a transactional scope: a top-level `begin()` if none is active,
    /// otherwise a named savepoint nested inside it.
    pub fn open(backend: &'a mut dyn BackendAdapter, rollback_on_exit: bool) -> Result<Self, Error> {
        let savepoint_id = if backend.in_transaction() {
            let id = format!("sp_{:x}", uuid_like_counter());
            backend.savepoint(&id)?;
            Some(id)
        } else {
            backend.begin()?;
            None
        };
        Ok(TransactionScope {
            backend,
            savepoint_id,
            rollback_on_exit,
            finished: false,
        })
    }

    /// Commit on success (or release the savepoint); roll back if an error
    /// occurred or `rollback_on_exit` was set. Must be called exactly once;
    /// the scope rolls back automatically on drop if it wasn't.
    pub fn finish(mut self, succeeded: bool) -> Result<(), Error> {
        self.finished = true;
        self.finish_inner(succeeded)
    }

    /// The backend this scope is wrapping, for executing statements inside
    /// the open transaction/savepoint.
    pub fn backend_mut(&mut self) -> &mut dyn BackendAdapter {
        &mut *self.backend
    }

    fn finish_inner(&mut self, succeeded: bool) -> Result<(), Error> {
        let should_rollback = !succeeded || self.rollback_on_exit;
        match (&self.savepoint_id, should_rollback) {
            (Some(id), true) => self.backend.savepoint_rollback(id),
            (Some(id), false) => self.backend.savepoint_release(id),
            (None, true) => self.backend.rollback(),
            (None, false) => self.backend.commit(),
        }
    }
}

impl<'a> Drop for TransactionScope<'a> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.finish_inner(false);
        }
    }
}

/// Not a real UUID: a cheap, process-local disambiguator for nested
/// savepoint names opened within the same transaction. Actual ledger UUIDs
/// come from [`crate::ledger`].
fn uuid_like_counter() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// RAII guard for [`disable_transactions`]: rolls back any pending
/// transaction on open, then restores nothing further on exit because
/// autocommit has no prior state to revert beyond "not in a transaction",
/// which is already guaranteed.
pub struct DisableTransactionsScope<'a> {
    backend: &'a mut dyn BackendAdapter,
}

impl<'a> DisableTransactionsScope<'a> {
    pub fn open(backend: &'a mut dyn BackendAdapter) -> Result<Self, Error> {
        if backend.in_transaction() {
            backend.rollback()?;
        }
        Ok(DisableTransactionsScope { backend })
    }

    pub fn backend(&mut self) -> &mut dyn BackendAdapter {
        &mut *self.backend
    }
}

pub fn transaction(
    backend: &mut dyn BackendAdapter,
    rollback_on_exit: bool,
) -> Result<TransactionScope<'_>, Error> {
    TransactionScope::open(backend, rollback_on_exit)
}

pub fn disable_transactions(backend: &mut dyn BackendAdapter) -> Result<DisableTransactionsScope<'_>, Error> {
    DisableTransactionsScope::open(backend)
}

fn ddl_cache() -> &'static Mutex<HashMap<String, bool>> {
    static CACHE: OnceLock<Mutex<HashMap<String, bool>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Detect whether `backend`'s DDL is transactional, running the detection
/// probe at most once per URI per process. Every migration in a batch
/// shares the same answer for a given URI instead of re-probing on each
/// `apply_one`/`rollback_one`.
pub fn has_transactional_ddl_cached(backend: &mut dyn BackendAdapter) -> Result<bool, Error> {
    let uri = backend.uri().to_string();
    if let Some(cached) = ddl_cache().lock().unwrap().get(&uri) {
        return Ok(*cached);
    }
    let detected = backend.has_transactional_ddl()?;
    ddl_cache().lock().unwrap().insert(uri, detected);
    Ok(detected)
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::backend::sqlite::SqliteAdapter;

    #[test]
    fn transactional_ddl_detection_is_cached_per_uri() {
        let dir = tempfile::tempdir().unwrap();
        let uri = dir.path().join("cache_test.db").to_str().unwrap().to_string();

        let mut backend = SqliteAdapter::connect(&uri).unwrap();
        let first = has_transactional_ddl_cached(&mut backend).unwrap();
        assert!(first, "sqlite DDL is transactional");
        assert_eq!(*ddl_cache().lock().unwrap().get(&uri).unwrap(), first);

        // A second adapter against the same URI reuses the cached answer
        // instead of re-running the create/drop probe.
        let mut backend2 = SqliteAdapter::connect(&uri).unwrap();
        let second = has_transactional_ddl_cached(&mut backend2).unwrap();
        assert_eq!(second, first);
    }
}
