//! Reference backend adapter built on `rusqlite`.
//!
//! SQLite is the only dialect this crate ships a driver for: DDL on SQLite
//! participates in the enclosing transaction, which makes it the simplest
//! backend to validate the engine's transactional-DDL path against.

use std::collections::HashMap;

use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::backend::{transaction, BackendAdapter};
use crate::error::{Error, WrapDatabaseError};
use crate::param;
use crate::value::{QueryResult, Row, Value};

pub struct SqliteAdapter {
    conn: Connection,
    uri: String,
    in_transaction: bool,
    lock_held: bool,
}

impl SqliteAdapter {
    /// Open a connection to `uri`. `:memory:` and ordinary filesystem paths
    /// are both accepted, matching `rusqlite::Connection::open`.
    pub fn connect(uri: &str) -> Result<Self, Error> {
        let conn = Connection::open(uri).db_err("opening sqlite connection")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .db_err("initializing sqlite connection")?;
        Ok(SqliteAdapter {
            conn,
            uri: uri.to_string(),
            in_transaction: false,
            lock_held: false,
        })
    }

    fn rusqlite_value(value: &Value) -> rusqlite::types::Value {
        match value {
            Value::Null => rusqlite::types::Value::Null,
            Value::Integer(i) => rusqlite::types::Value::Integer(*i),
            Value::Real(r) => rusqlite::types::Value::Real(*r),
            Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
            Value::Blob(b) => rusqlite::types::Value::Blob(b.clone()),
        }
    }

    fn from_value_ref(v: ValueRef<'_>) -> Value {
        match v {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(r) => Value::Real(r),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

impl BackendAdapter for SqliteAdapter {
    fn execute(&mut self, sql: &str, params: &HashMap<String, Value>) -> Result<QueryResult, Error> {
        let translated = param::translate(sql, params)?;
        let bound: Vec<rusqlite::types::Value> =
            translated.values.iter().map(Self::rusqlite_value).collect();

        let mut stmt = self
            .conn
            .prepare(&translated.sql)
            .db_err("preparing statement")?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

        let param_refs: Vec<&dyn rusqlite::ToSql> =
            bound.iter().map(|v| v as &dyn rusqlite::ToSql).collect();

        let mut rows_iter = stmt
            .query(param_refs.as_slice())
            .db_err("executing statement")?;

        let mut rows = Vec::new();
        while let Some(row) = rows_iter.next().db_err("reading row")? {
            let values = (0..columns.len())
                .map(|i| Self::from_value_ref(row.get_ref(i).expect("column index in range")))
                .collect();
            rows.push(Row(values));
        }

        Ok(QueryResult { columns, rows })
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.conn.execute_batch("COMMIT").db_err("commit")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        self.conn.execute_batch("ROLLBACK").db_err("rollback")?;
        self.in_transaction = false;
        Ok(())
    }

    fn begin(&mut self) -> Result<(), Error> {
        if self.in_transaction {
            return Err(Error::Usage("begin() called while already in a transaction".into()));
        }
        self.conn.execute_batch("BEGIN").db_err("begin")?;
        self.in_transaction = true;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn savepoint(&mut self, id: &str) -> Result<(), Error> {
        self.conn
            .execute_batch(&format!("SAVEPOINT {id}"))
            .db_err("savepoint")
    }

    fn savepoint_release(&mut self, id: &str) -> Result<(), Error> {
        self.conn
            .execute_batch(&format!("RELEASE SAVEPOINT {id}"))
            .db_err("savepoint release")
    }

    fn savepoint_rollback(&mut self, id: &str) -> Result<(), Error> {
        self.conn
            .execute_batch(&format!("ROLLBACK TO SAVEPOINT {id}"))
            .db_err("savepoint rollback")
    }

    fn list_tables(&mut self) -> Result<Vec<String>, Error> {
        let result = self.execute(
            "select name from sqlite_master where type = 'table'",
            &HashMap::new(),
        )?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| match row.0.into_iter().next() {
                Some(Value::Text(name)) => Some(name),
                _ => None,
            })
            .collect())
    }

    fn has_transactional_ddl(&mut self) -> Result<bool, Error> {
        // SQLite's own DDL always participates in the enclosing
        // transaction; confirmed here with the probe used for dialects
        // where this isn't a documented guarantee, so the detection path
        // itself stays exercised.
        detect_transactional_ddl(self)
    }

    fn copy(&self) -> Result<Self, Error> {
        SqliteAdapter::connect(&self.uri)
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    fn lock_held(&self) -> bool {
        self.lock_held
    }

    fn set_lock_held(&mut self, held: bool) {
        self.lock_held = held;
    }

    fn ensure_lock_table(&mut self, table: &str) -> Result<(), Error> {
        let quoted = self.quote_identifier(table)?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {quoted} (locked INTEGER DEFAULT 1, ctime TEXT, pid INTEGER NOT NULL, PRIMARY KEY (locked))"
        );
        self.execute(&sql, &HashMap::new())?;
        Ok(())
    }

    fn lock_table_insert(&mut self, table: &str, pid: u32) -> Result<bool, Error> {
        let quoted = self.quote_identifier(table)?;
        let mut params = HashMap::new();
        params.insert("pid".to_string(), Value::Integer(pid as i64));
        let sql = format!("INSERT INTO {quoted} (locked, ctime, pid) VALUES (1, datetime('now'), :pid)");
        match self.execute(&sql, &params) {
            Ok(_) => Ok(true),
            Err(Error::Database { .. }) => Ok(false),
            Err(other) => Err(other),
        }
    }

    fn lock_table_delete(&mut self, table: &str, pid: u32) -> Result<(), Error> {
        let quoted = self.quote_identifier(table)?;
        let mut params = HashMap::new();
        params.insert("pid".to_string(), Value::Integer(pid as i64));
        let sql = format!("DELETE FROM {quoted} WHERE pid = :pid");
        self.execute(&sql, &params)?;
        Ok(())
    }

    fn lock_table_holder_pid(&mut self, table: &str) -> Result<Option<u32>, Error> {
        let quoted = self.quote_identifier(table)?;
        let result = self.execute(&format!("SELECT pid FROM {quoted} LIMIT 1"), &HashMap::new())?;
        Ok(result.rows.first().and_then(|row| match row.0.first() {
            Some(Value::Integer(pid)) => Some(*pid as u32),
            _ => None,
        }))
    }

    fn lock_table_truncate(&mut self, table: &str) -> Result<(), Error> {
        let quoted = self.quote_identifier(table)?;
        self.execute(&format!("DELETE FROM {quoted}"), &HashMap::new())?;
        Ok(())
    }
}

/// Probe whether DDL participates in the enclosing transaction: create a
/// temp table in a rollback-on-exit transaction, then try to drop it in a
/// fresh transaction. If the drop fails because the table is already gone,
/// the first transaction's rollback undid the `CREATE TABLE`, so DDL is
/// transactional.
fn detect_transactional_ddl(backend: &mut dyn BackendAdapter) -> Result<bool, Error> {
    let table = backend.quote_identifier("_migration_ddl_probe")?;

    {
        let scope = transaction(backend, true)?;
        let created = scope
            .backend
            .execute(&format!("CREATE TABLE {table} (x INTEGER)"), &HashMap::new());
        let ok = created.is_ok();
        scope.finish(ok)?;
        if !ok {
            return Ok(false);
        }
    }

    let dropped = {
        let scope = transaction(backend, false)?;
        let result = scope.backend.execute(&format!("DROP TABLE {table}"), &HashMap::new());
        let ok = result.is_ok();
        scope.finish(ok)?;
        result
    };

    Ok(dropped.is_err())
}
