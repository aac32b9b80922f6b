//! Orchestrates loader → sort → lock → ledger → step-execution: apply,
//! rollback, mark, unmark, and post-apply hooks.

use std::io::{self, Write};

use log::{info, warn};

use crate::backend::BackendAdapter;
use crate::config::EngineConfig;
use crate::error::Error;
use crate::ledger::{Ledger, Operation};
use crate::lock::LockManager;
use crate::migration::{Migration, MigrationSet};
use crate::sort::topological_sort;
use crate::step::Direction;

/// Drives migrations against one backend. Holds the "primary" connection
/// used for ledger/lock bookkeeping; each migration's steps run on a
/// separate connection obtained via `backend.copy()`, so a migration's open
/// transaction never entangles with ledger writes.
pub struct Engine<B: BackendAdapter> {
    backend: B,
    config: EngineConfig,
    out: Box<dyn Write + Send>,
    schema_checked: bool,
}

impl<B: BackendAdapter> Engine<B> {
    pub fn new(backend: B, config: EngineConfig) -> Self {
        Engine {
            backend,
            config,
            out: Box::new(io::stdout()),
            schema_checked: false,
        }
    }

    /// Redirect tabulated `SELECT` output to something other than stdout.
    pub fn with_output_sink(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.out = sink;
        self
    }

    fn ledger(&mut self) -> Ledger<'_> {
        Ledger::with_schema_checked(&mut self.backend, self.config.clone(), self.schema_checked)
    }

    /// Run the internal-schema check at most once per `Engine`: every other
    /// call site asks for this instead of going through `Ledger` directly,
    /// so the lock/version-table round trip only happens on the first call.
    fn ensure_schema(&mut self) -> Result<(), Error> {
        if self.schema_checked {
            return Ok(());
        }
        let mut ledger = self.ledger();
        ledger.ensure_internal_schema_updated()?;
        self.schema_checked = ledger.schema_checked();
        Ok(())
    }

    fn lock_manager(&mut self) -> LockManager<'_> {
        LockManager::new(
            &mut self.backend,
            self.config.lock_table.clone(),
            self.config.lock_timeout,
            self.config.lock_poll_interval,
        )
    }

    /// Acquire the cross-process lock for the duration of `body`, a single
    /// ledger-mutating operation (apply, rollback, mark, unmark), then
    /// release it. A no-op wrapper if the lock is already held by this
    /// adapter instance — e.g. when `apply_one` runs inside `apply_many`'s
    /// own `with_lock`, so a batch acquires the lock once for its whole
    /// duration rather than once per migration.
    fn with_lock<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T, Error>) -> Result<T, Error> {
        let already_held = self.backend.lock_held();
        if !already_held {
            let mut lock_manager = self.lock_manager();
            lock_manager.ensure_table()?;
            lock_manager.acquire_and_hold()?;
        }
        let result = body(self);
        if !already_held {
            self.lock_manager().release_held()?;
        }
        result
    }

    /// Filter `migrations` to the subset not yet applied, then topologically
    /// sort them.
    pub fn to_apply<'m>(&mut self, migrations: &'m MigrationSet<B>) -> Result<Vec<&'m Migration<B>>, Error> {
        let applied = self.ledger().applied_hashes()?;
        let candidates: Vec<&Migration<B>> = migrations
            .items
            .iter()
            .filter(|m| !applied.iter().any(|h| h == &m.hash))
            .collect();
        sort_by_dependency(candidates, migrations)
    }

    /// Filter to migrations already applied, sort, then reverse (dependents
    /// roll back before the dependencies they rely on).
    pub fn to_rollback<'m>(&mut self, migrations: &'m MigrationSet<B>) -> Result<Vec<&'m Migration<B>>, Error> {
        let applied = self.ledger().applied_hashes()?;
        let candidates: Vec<&Migration<B>> = migrations
            .items
            .iter()
            .filter(|m| applied.iter().any(|h| h == &m.hash))
            .collect();
        let mut sorted = sort_by_dependency(candidates, migrations)?;
        sorted.reverse();
        Ok(sorted)
    }

    /// Apply a single migration. Ledger writes happen on `self.backend`;
    /// the migration's own steps run on an independent connection.
    pub fn apply_one(&mut self, migration: &Migration<B>, force: bool) -> Result<(), Error> {
        self.with_lock(move |this| this.apply_one_locked(migration, force))
    }

    fn apply_one_locked(&mut self, migration: &Migration<B>, force: bool) -> Result<(), Error> {
        info!("applying {}", migration.id);
        self.ensure_schema()?;

        let mut migration_backend = self.backend.copy()?;
        let has_ddl_transactions = crate::backend::has_transactional_ddl_cached(&mut migration_backend)?;

        let run_result = crate::step::run_steps(
            &migration.steps,
            Direction::Apply,
            &mut migration_backend,
            migration.use_transactions,
            force,
            has_ddl_transactions,
            self.out.as_mut(),
        );

        if let Err(err) = run_result {
            warn!("apply of {} failed: {err}", migration.id);
            return Err(err);
        }

        self.ledger().log(
            Some(&migration.id),
            Some(&migration.hash),
            Operation::Apply,
            None,
        )?;
        self.ledger().mark_in_transaction(&migration.id, &migration.hash)?;
        Ok(())
    }

    /// Rollback a single migration: steps execute in reverse order, then
    /// the ledger is updated symmetrically to `apply_one`.
    pub fn rollback_one(&mut self, migration: &Migration<B>, force: bool) -> Result<(), Error> {
        self.with_lock(move |this| this.rollback_one_locked(migration, force))
    }

    fn rollback_one_locked(&mut self, migration: &Migration<B>, force: bool) -> Result<(), Error> {
        info!("rolling back {}", migration.id);
        self.ensure_schema()?;

        let mut migration_backend = self.backend.copy()?;
        let has_ddl_transactions = crate::backend::has_transactional_ddl_cached(&mut migration_backend)?;

        crate::step::run_steps(
            &migration.steps,
            Direction::Rollback,
            &mut migration_backend,
            migration.use_transactions,
            force,
            has_ddl_transactions,
            self.out.as_mut(),
        )?;

        self.ledger().log(
            Some(&migration.id),
            Some(&migration.hash),
            Operation::Rollback,
            None,
        )?;
        self.ledger().unmark_in_transaction(&migration.hash)?;
        Ok(())
    }

    /// Apply every migration in `migrations` (input order), skipping any
    /// that fail to load as `BadMigration`. `set` is the owning
    /// `MigrationSet` that `migrations` was filtered from; its post-apply
    /// hooks run once at the end, only if at least one migration applied.
    /// Acquires the lock once for the whole batch: later calls to
    /// `apply_one` inside the loop see the lock already held and skip
    /// acquiring it again.
    pub fn apply_many(
        &mut self,
        migrations: &[&Migration<B>],
        set: &MigrationSet<B>,
        force: bool,
    ) -> Result<(), Error> {
        self.with_lock(move |this| this.apply_many_locked(migrations, set, force))
    }

    fn apply_many_locked(
        &mut self,
        migrations: &[&Migration<B>],
        set: &MigrationSet<B>,
        force: bool,
    ) -> Result<(), Error> {
        self.ensure_schema()?;
        if migrations.is_empty() {
            info!("no migrations to apply");
            return Ok(());
        }

        let mut applied_any = false;
        for migration in migrations.iter().copied() {
            match self.apply_one(migration, force) {
                Ok(()) => applied_any = true,
                Err(err) if err.is_bad_migration() => {
                    warn!("skipping bad migration {}: {err}", migration.id);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        if applied_any {
            self.run_post_apply(set, force)?;
        }
        Ok(())
    }

    /// Acquires the lock once for the whole batch, like `apply_many`.
    pub fn rollback_many(&mut self, migrations: &[&Migration<B>], force: bool) -> Result<(), Error> {
        self.with_lock(move |this| this.rollback_many_locked(migrations, force))
    }

    fn rollback_many_locked(&mut self, migrations: &[&Migration<B>], force: bool) -> Result<(), Error> {
        self.ensure_schema()?;
        for migration in migrations.iter().copied() {
            match self.rollback_one(migration, force) {
                Ok(()) => {}
                Err(err) if err.is_bad_migration() => {
                    warn!("skipping bad migration {}: {err}", migration.id);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Run the post-apply hooks belonging to `set`, unconditionally. They
    /// are never marked and never considered for `is_applied`. Called by
    /// [`Engine::apply_many`] after a non-empty batch, or directly by
    /// callers that want to re-run hooks without applying anything new.
    pub fn run_post_apply(&mut self, set: &MigrationSet<B>, force: bool) -> Result<(), Error> {
        for hook in &set.post_apply {
            info!("running post-apply hook {}", hook.id);
            let mut migration_backend = self.backend.copy()?;
            let has_ddl_transactions = crate::backend::has_transactional_ddl_cached(&mut migration_backend)?;
            crate::step::run_steps(
                &hook.steps,
                Direction::Apply,
                &mut migration_backend,
                hook.use_transactions,
                force,
                has_ddl_transactions,
                self.out.as_mut(),
            )?;
        }
        Ok(())
    }

    pub fn mark(&mut self, migration: &Migration<B>) -> Result<(), Error> {
        self.with_lock(move |this| {
            this.ensure_schema()?;
            this.ledger().mark_in_transaction(&migration.id, &migration.hash)?;
            this.ledger()
                .log(Some(&migration.id), Some(&migration.hash), Operation::Mark, None)
        })
    }

    pub fn unmark(&mut self, migration: &Migration<B>) -> Result<(), Error> {
        self.with_lock(move |this| {
            this.ensure_schema()?;
            this.ledger().unmark_in_transaction(&migration.hash)?;
            this.ledger()
                .log(Some(&migration.id), Some(&migration.hash), Operation::Unmark, None)
        })
    }

    pub fn break_lock(&mut self) -> Result<(), Error> {
        self.lock_manager().break_lock()
    }

    pub fn list_tables(&mut self) -> Result<Vec<String>, Error> {
        self.backend.list_tables()
    }
}

fn sort_by_dependency<'m, B: BackendAdapter>(
    candidates: Vec<&'m Migration<B>>,
    full_set: &'m MigrationSet<B>,
) -> Result<Vec<&'m Migration<B>>, Error> {
    let by_id: std::collections::HashMap<&str, &Migration<B>> =
        full_set.items.iter().map(|m| (m.id.as_str(), m)).collect();

    topological_sort(&candidates, |m| {
        m.depends
            .iter()
            .filter_map(|dep| by_id.get(dep.as_str()))
            .filter(|dep| candidates_contains(&candidates, dep))
            .copied()
            .collect::<Vec<_>>()
    })
}

fn candidates_contains<B: BackendAdapter>(candidates: &[&Migration<B>], target: &Migration<B>) -> bool {
    candidates.iter().any(|m| std::ptr::eq(*m, target))
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::backend::sqlite::SqliteAdapter;
    use crate::step::{IgnoreErrors, StepCollector, StepPayload};

    fn engine_on(uri: &str) -> Engine<SqliteAdapter> {
        let backend = SqliteAdapter::connect(uri).unwrap();
        Engine::new(backend, EngineConfig::default())
    }

    fn create_users_migration() -> Migration<SqliteAdapter> {
        let mut migration = Migration::new("0001-create-users", "0001-create-users.sql", "default");
        let mut collector = StepCollector::new();
        collector.step(
            StepPayload::Sql("CREATE TABLE users (id INTEGER PRIMARY KEY)".into()),
            Some(StepPayload::Sql("DROP TABLE users".into())),
        );
        migration.steps = collector.into_steps();
        migration
    }

    #[test]
    fn apply_one_then_rollback_one_round_trips_the_ledger_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let uri = dir.path().join("engine_roundtrip.db").to_str().unwrap().to_string();
        let mut engine = engine_on(&uri);
        let migration = create_users_migration();

        engine.apply_one(&migration, false).unwrap();
        assert!(engine.list_tables().unwrap().iter().any(|t| t == "users"));
        assert!(engine.ledger().is_applied(&migration.hash).unwrap());

        engine.rollback_one(&migration, false).unwrap();
        assert!(!engine.list_tables().unwrap().iter().any(|t| t == "users"));
        assert!(!engine.ledger().is_applied(&migration.hash).unwrap());
    }

    #[test]
    fn apply_many_holds_the_lock_once_across_the_whole_batch() {
        // A batch of more than one migration must not deadlock: apply_many
        // acquires the lock once, and each inner apply_one sees it already
        // held and skips acquiring it again.
        let dir = tempfile::tempdir().unwrap();
        let uri = dir.path().join("engine_batch.db").to_str().unwrap().to_string();
        let mut engine = engine_on(&uri);

        let mut set = MigrationSet::new();
        set.insert(create_users_migration()).unwrap();
        let mut second = Migration::new("0002-add-index", "0002-add-index.sql", "default");
        let mut collector = StepCollector::new();
        collector.step(
            StepPayload::Sql("CREATE INDEX idx_users_id ON users (id)".into()),
            Some(StepPayload::Sql("DROP INDEX idx_users_id".into())),
        );
        second.depends = vec!["0001-create-users".into()];
        second.steps = collector.into_steps();
        set.insert(second).unwrap();

        let to_apply = engine.to_apply(&set).unwrap();
        assert_eq!(to_apply.len(), 2);
        engine.apply_many(&to_apply, &set, false).unwrap();

        assert!(engine.list_tables().unwrap().iter().any(|t| t == "users"));
        assert!(engine.to_apply(&set).unwrap().is_empty());
    }

    #[test]
    fn mark_without_applying_records_the_ledger_but_not_the_schema() {
        let dir = tempfile::tempdir().unwrap();
        let uri = dir.path().join("engine_mark.db").to_str().unwrap().to_string();
        let mut engine = engine_on(&uri);
        let migration = create_users_migration();

        engine.mark(&migration).unwrap();
        assert!(engine.ledger().is_applied(&migration.hash).unwrap());
        assert!(!engine.list_tables().unwrap().iter().any(|t| t == "users"));

        engine.unmark(&migration).unwrap();
        assert!(!engine.ledger().is_applied(&migration.hash).unwrap());
    }

    #[test]
    fn ignore_errors_tolerates_a_failing_step() {
        let dir = tempfile::tempdir().unwrap();
        let uri = dir.path().join("engine_ignore.db").to_str().unwrap().to_string();
        let mut engine = engine_on(&uri);

        let mut migration = Migration::new("0001-tolerant", "0001-tolerant.sql", "default");
        let mut collector = StepCollector::new();
        collector.step_ignoring_errors(
            StepPayload::Sql("this is not valid sql".into()),
            None,
            IgnoreErrors::Apply,
        );
        migration.steps = collector.into_steps();

        engine.apply_one(&migration, false).unwrap();
        assert!(engine.ledger().is_applied(&migration.hash).unwrap());
    }
}
