//! Persistent record of applied migrations and the append-only operation
//! log, plus internal schema bootstrap/upgrade.

use std::collections::HashMap;

use log::info;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::backend::{transaction, BackendAdapter};
use crate::config::EngineConfig;
use crate::error::Error;
use crate::value::Value;

const INTERNAL_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Apply,
    Rollback,
    Mark,
    Unmark,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Operation::Apply => "apply",
            Operation::Rollback => "rollback",
            Operation::Mark => "mark",
            Operation::Unmark => "unmark",
        }
    }
}

/// Reads and writes the three ledger tables (applied migrations, operation
/// log, internal schema version) against one backend connection.
///
/// Deliberately holds its own connection, separate from the one used to run
/// a migration's steps (see [`crate::engine`]), so the ledger is never left
/// mid-transaction by a user migration's DDL.
pub struct Ledger<'a> {
    backend: &'a mut dyn BackendAdapter,
    config: EngineConfig,
    internal_schema_checked: bool,
}

impl<'a> Ledger<'a> {
    pub fn new(backend: &'a mut dyn BackendAdapter, config: EngineConfig) -> Self {
        Ledger {
            backend,
            config,
            internal_schema_checked: false,
        }
    }

    /// Like [`Ledger::new`], but pre-seeded with whether the internal schema
    /// has already been checked this process, so a caller holding that flag
    /// across many short-lived `Ledger` values (e.g. [`crate::engine::Engine`])
    /// doesn't re-acquire the lock and re-read the version table every time.
    pub fn with_schema_checked(backend: &'a mut dyn BackendAdapter, config: EngineConfig, checked: bool) -> Self {
        Ledger {
            backend,
            config,
            internal_schema_checked: checked,
        }
    }

    /// Whether [`Ledger::ensure_internal_schema_updated`] has run to
    /// completion on this value.
    pub fn schema_checked(&self) -> bool {
        self.internal_schema_checked
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Idempotent; upgrades the ledger's own tables under the lock if the
    /// on-disk schema version is behind what this build expects. Must not
    /// be called while a transaction is already open.
    pub fn ensure_internal_schema_updated(&mut self) -> Result<(), Error> {
        if self.internal_schema_checked {
            return Ok(());
        }
        if self.backend.in_transaction() {
            return Err(Error::Usage(
                "ensure_internal_schema_updated called inside an open transaction".into(),
            ));
        }

        let already_held = self.backend.lock_held();
        {
            let mut lock = crate::lock::LockManager::new(
                self.backend,
                self.config.lock_table.clone(),
                self.config.lock_timeout,
                self.config.lock_poll_interval,
            );
            lock.ensure_table()?;
            lock.acquire_and_hold()?;
        }

        let result = (|| {
            self.create_tables_if_missing()?;
            let version = self.read_schema_version()?;
            if version < INTERNAL_SCHEMA_VERSION {
                info!(
                    "upgrading internal migration-ledger schema from {} to {}",
                    version, INTERNAL_SCHEMA_VERSION
                );
                self.write_schema_version(INTERNAL_SCHEMA_VERSION)?;
            }
            Ok(())
        })();

        if !already_held {
            let mut lock = crate::lock::LockManager::new(
                self.backend,
                self.config.lock_table.clone(),
                self.config.lock_timeout,
                self.config.lock_poll_interval,
            );
            lock.release_held()?;
        }

        result?;
        self.internal_schema_checked = true;
        Ok(())
    }

    fn create_tables_if_missing(&mut self) -> Result<(), Error> {
        let migration_table = self.backend.quote_identifier(&self.config.migration_table)?;
        let log_table = self.backend.quote_identifier(&self.config.log_table)?;
        let version_table = self.backend.quote_identifier(&self.config.version_table)?;

        self.backend.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {migration_table} (\
                 migration_hash TEXT PRIMARY KEY, \
                 migration_id TEXT NOT NULL, \
                 applied_at_utc TEXT NOT NULL)"
            ),
            &HashMap::new(),
        )?;

        self.backend.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {log_table} (\
                 id TEXT PRIMARY KEY, \
                 migration_id TEXT, \
                 migration_hash TEXT, \
                 operation TEXT NOT NULL, \
                 username TEXT, \
                 hostname TEXT, \
                 created_at_utc TEXT NOT NULL, \
                 comment TEXT)"
            ),
            &HashMap::new(),
        )?;

        self.backend.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {version_table} (\
                 version INTEGER NOT NULL, \
                 installed_at_utc TEXT NOT NULL)"
            ),
            &HashMap::new(),
        )?;

        Ok(())
    }

    fn read_schema_version(&mut self) -> Result<i64, Error> {
        let version_table = self.backend.quote_identifier(&self.config.version_table)?;
        let result = self
            .backend
            .execute(&format!("SELECT version FROM {version_table} LIMIT 1"), &HashMap::new())?;
        Ok(match result.rows.first().and_then(|r| r.get(0)) {
            Some(Value::Integer(v)) => *v,
            _ => 0,
        })
    }

    fn write_schema_version(&mut self, version: i64) -> Result<(), Error> {
        let version_table = self.backend.quote_identifier(&self.config.version_table)?;
        self.backend.execute(&format!("DELETE FROM {version_table}"), &HashMap::new())?;
        let mut params = HashMap::new();
        params.insert("version".to_string(), Value::Integer(version));
        params.insert("installed_at_utc".to_string(), Value::Text(utc_now_rfc3339()));
        self.backend.execute(
            &format!("INSERT INTO {version_table} (version, installed_at_utc) VALUES (:version, :installed_at_utc)"),
            &params,
        )?;
        Ok(())
    }

    /// Hashes of applied migrations, in the order they were applied.
    pub fn applied_hashes(&mut self) -> Result<Vec<String>, Error> {
        self.ensure_internal_schema_updated()?;
        let migration_table = self.backend.quote_identifier(&self.config.migration_table)?;
        let result = self.backend.execute(
            &format!("SELECT migration_hash FROM {migration_table} ORDER BY applied_at_utc"),
            &HashMap::new(),
        )?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| match row.0.into_iter().next() {
                Some(Value::Text(hash)) => Some(hash),
                _ => None,
            })
            .collect())
    }

    pub fn is_applied(&mut self, hash: &str) -> Result<bool, Error> {
        Ok(self.applied_hashes()?.iter().any(|h| h == hash))
    }

    /// Insert the applied row for `(id, hash)`. Does not write the log;
    /// callers that want both call [`Ledger::log`] themselves, in the order
    /// the source library does: log the attempt, then mark as applied.
    pub fn mark(&mut self, id: &str, hash: &str) -> Result<(), Error> {
        self.ensure_internal_schema_updated()?;
        mark_on(self.backend, &self.config, id, hash)
    }

    pub fn unmark(&mut self, hash: &str) -> Result<(), Error> {
        self.ensure_internal_schema_updated()?;
        unmark_on(self.backend, &self.config, hash)
    }

    /// Mark inside its own transaction, mirroring the two-connections
    /// discipline: the ledger write commits independently of whatever
    /// transaction the migration's steps ran under.
    pub fn mark_in_transaction(&mut self, id: &str, hash: &str) -> Result<(), Error> {
        self.ensure_internal_schema_updated()?;
        let mut scope = transaction(self.backend, false)?;
        let result = mark_on(scope.backend_mut(), &self.config, id, hash);
        scope.finish(result.is_ok())?;
        result
    }

    pub fn unmark_in_transaction(&mut self, hash: &str) -> Result<(), Error> {
        self.ensure_internal_schema_updated()?;
        let mut scope = transaction(self.backend, false)?;
        let result = unmark_on(scope.backend_mut(), &self.config, hash);
        scope.finish(result.is_ok())?;
        result
    }

    /// Append a log row with a fresh time-ordered UUID, the current UTC
    /// timestamp, and the process user/host.
    pub fn log(
        &mut self,
        id: Option<&str>,
        hash: Option<&str>,
        operation: Operation,
        comment: Option<&str>,
    ) -> Result<(), Error> {
        let log_table = self.backend.quote_identifier(&self.config.log_table)?;
        let mut params = HashMap::new();
        params.insert("id".to_string(), Value::Text(new_log_id()));
        params.insert(
            "migration_id".to_string(),
            id.map(|s| Value::Text(s.to_string())).unwrap_or(Value::Null),
        );
        params.insert(
            "migration_hash".to_string(),
            hash.map(|s| Value::Text(s.to_string())).unwrap_or(Value::Null),
        );
        params.insert("operation".to_string(), Value::Text(operation.as_str().to_string()));
        params.insert("username".to_string(), Value::Text(whoami::username()));
        params.insert("hostname".to_string(), Value::Text(whoami::fallible::hostname().unwrap_or_default()));
        params.insert("created_at_utc".to_string(), Value::Text(utc_now_rfc3339()));
        params.insert(
            "comment".to_string(),
            comment.map(|s| Value::Text(s.to_string())).unwrap_or(Value::Null),
        );

        self.backend.execute(
            &format!(
                "INSERT INTO {log_table} \
                 (id, migration_id, migration_hash, operation, username, hostname, created_at_utc, comment) \
                 VALUES (:id, :migration_id, :migration_hash, :operation, :username, :hostname, :created_at_utc, :comment)"
            ),
            &params,
        )?;
        Ok(())
    }
}

fn mark_on(backend: &mut dyn BackendAdapter, config: &EngineConfig, id: &str, hash: &str) -> Result<(), Error> {
    let migration_table = backend.quote_identifier(&config.migration_table)?;
    let mut params = HashMap::new();
    params.insert("migration_hash".to_string(), Value::Text(hash.to_string()));
    params.insert("migration_id".to_string(), Value::Text(id.to_string()));
    params.insert("when".to_string(), Value::Text(utc_now_rfc3339()));
    backend.execute(
        &format!(
            "INSERT INTO {migration_table} (migration_hash, migration_id, applied_at_utc) \
             VALUES (:migration_hash, :migration_id, :when)"
        ),
        &params,
    )?;
    Ok(())
}

fn unmark_on(backend: &mut dyn BackendAdapter, config: &EngineConfig, hash: &str) -> Result<(), Error> {
    let migration_table = backend.quote_identifier(&config.migration_table)?;
    let mut params = HashMap::new();
    params.insert("migration_hash".to_string(), Value::Text(hash.to_string()));
    backend.execute(
        &format!("DELETE FROM {migration_table} WHERE migration_hash = :migration_hash"),
        &params,
    )?;
    Ok(())
}

fn utc_now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// A time-ordered (v1) UUID. The node id is derived from the hostname and
/// pid rather than a MAC address, since the engine has no business reading
/// network hardware for a log row's identity.
fn new_log_id() -> String {
    use sha2::{Digest, Sha256};

    let seed = format!("{}-{}", whoami::fallible::hostname().unwrap_or_default(), std::process::id());
    let digest = Sha256::digest(seed.as_bytes());
    let mut node_id = [0u8; 6];
    node_id.copy_from_slice(&digest[0..6]);

    let now = OffsetDateTime::now_utc();
    let ts = uuid::Timestamp::from_unix(uuid::NoContext, now.unix_timestamp() as u64, now.nanosecond());
    Uuid::new_v1(ts, &node_id).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sqlite::SqliteAdapter;

    #[test]
    fn mark_and_unmark_round_trip() {
        let mut backend = SqliteAdapter::connect(":memory:").unwrap();
        let mut ledger = Ledger::new(&mut backend, EngineConfig::default());
        ledger.ensure_internal_schema_updated().unwrap();

        assert!(!ledger.is_applied("abc123").unwrap());
        ledger.mark("0001-create-users", "abc123").unwrap();
        assert!(ledger.is_applied("abc123").unwrap());
        assert_eq!(ledger.applied_hashes().unwrap(), vec!["abc123".to_string()]);

        ledger.unmark("abc123").unwrap();
        assert!(!ledger.is_applied("abc123").unwrap());
    }

    #[test]
    fn log_records_operation_with_fresh_id() {
        let mut backend = SqliteAdapter::connect(":memory:").unwrap();
        let mut ledger = Ledger::new(&mut backend, EngineConfig::default());
        ledger.ensure_internal_schema_updated().unwrap();
        ledger
            .log(Some("0001-create-users"), Some("abc123"), Operation::Apply, None)
            .unwrap();

        let log_table = backend.quote_identifier("_migration_log").unwrap();
        let result = backend
            .execute(&format!("SELECT operation FROM {log_table}"), &HashMap::new())
            .unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[test]
    fn internal_schema_check_is_idempotent() {
        let mut backend = SqliteAdapter::connect(":memory:").unwrap();
        let mut ledger = Ledger::new(&mut backend, EngineConfig::default());
        ledger.ensure_internal_schema_updated().unwrap();
        ledger.ensure_internal_schema_updated().unwrap();
    }
}
