mod engine_scenarios {
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use stratum_migrate::{
        BackendAdapter, Engine, EngineConfig, IgnoreErrors, Migration, MigrationSet, SqliteAdapter, StepCollector,
        StepPayload,
    };

    /// Whether `migration` shows up as applied, checked the only way the
    /// public API exposes: a single-migration set is "applied" exactly when
    /// it's a candidate for rollback.
    fn is_applied(engine: &mut Engine<SqliteAdapter>, migration: Migration<SqliteAdapter>) -> bool {
        let mut set = MigrationSet::new();
        set.insert(migration).unwrap();
        !engine.to_rollback(&set).unwrap().is_empty()
    }

    fn engine_on(uri: &str) -> Engine<SqliteAdapter> {
        let backend = SqliteAdapter::connect(uri).unwrap();
        Engine::new(backend, EngineConfig::default())
    }

    fn temp_uri(name: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let uri = dir.path().join(name).to_str().unwrap().to_string();
        (dir, uri)
    }

    fn create_table(id: &str, table: &str, depends: &[&str]) -> Migration<SqliteAdapter> {
        let mut migration = Migration::new(id, format!("{id}.sql"), "default");
        migration.depends = depends.iter().map(|s| s.to_string()).collect();
        let mut collector = StepCollector::new();
        collector.step(
            StepPayload::Sql(format!("CREATE TABLE {table} (id INTEGER PRIMARY KEY)")),
            Some(StepPayload::Sql(format!("DROP TABLE {table}"))),
        );
        migration.steps = collector.into_steps();
        migration
    }

    #[test]
    fn linear_apply_then_rollback_leaves_no_trace() {
        let (_dir, uri) = temp_uri("linear.db");
        let mut engine = engine_on(&uri);

        let mut set = MigrationSet::new();
        set.insert(create_table("0001-users", "users", &[])).unwrap();
        set.insert(create_table("0002-orders", "orders", &["0001-users"])).unwrap();

        let to_apply = engine.to_apply(&set).unwrap();
        assert_eq!(
            to_apply.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["0001-users", "0002-orders"]
        );
        engine.apply_many(&to_apply, &set, false).unwrap();

        let tables = engine.list_tables().unwrap();
        assert!(tables.iter().any(|t| t == "users"));
        assert!(tables.iter().any(|t| t == "orders"));
        assert!(engine.to_apply(&set).unwrap().is_empty());

        let to_rollback = engine.to_rollback(&set).unwrap();
        assert_eq!(
            to_rollback.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["0002-orders", "0001-users"],
            "rollback order is the reverse of apply order"
        );
        engine.rollback_many(&to_rollback, false).unwrap();

        let tables = engine.list_tables().unwrap();
        assert!(!tables.iter().any(|t| t == "users" || t == "orders"));
        assert_eq!(engine.to_apply(&set).unwrap().len(), 2);
    }

    #[test]
    fn dependency_cycle_is_rejected_before_anything_runs() {
        let (_dir, uri) = temp_uri("cycle.db");
        let mut engine = engine_on(&uri);

        let mut set = MigrationSet::new();
        set.insert(create_table("a", "a_table", &["b"])).unwrap();
        set.insert(create_table("b", "b_table", &["a"])).unwrap();

        let err = engine.to_apply(&set).unwrap_err();
        assert!(matches!(err, stratum_migrate::Error::Cycle(_)));
        assert!(!engine.list_tables().unwrap().iter().any(|t| t == "a_table" || t == "b_table"));
    }

    #[test]
    fn independent_migrations_keep_discovery_order() {
        let (_dir, uri) = temp_uri("stable_order.db");
        let mut engine = engine_on(&uri);

        let mut set = MigrationSet::new();
        set.insert(create_table("0003-z", "z_table", &[])).unwrap();
        set.insert(create_table("0001-a", "a_table", &[])).unwrap();
        set.insert(create_table("0002-m", "m_table", &[])).unwrap();

        let to_apply = engine.to_apply(&set).unwrap();
        assert_eq!(
            to_apply.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["0003-z", "0001-a", "0002-m"],
            "no dependencies between these, so insertion order is preserved"
        );
    }

    #[test]
    fn mid_migration_failure_with_transactional_ddl_undoes_the_whole_migration() {
        let (_dir, uri) = temp_uri("transactional_failure.db");
        let mut engine = engine_on(&uri);

        let mut migration = Migration::new("0001-half-baked", "0001-half-baked.sql", "default");
        let mut collector = StepCollector::new();
        collector.step(
            StepPayload::Sql("CREATE TABLE orders (id INTEGER PRIMARY KEY)".into()),
            Some(StepPayload::Sql("DROP TABLE orders".into())),
        );
        collector.step(StepPayload::Sql("this is not valid sql".into()), None);
        migration.steps = collector.into_steps();
        assert!(migration.use_transactions, "default migration uses transactions");

        let err = engine.apply_one(&migration, false).unwrap_err();
        assert!(matches!(err, stratum_migrate::Error::Database { .. }));

        assert!(
            !engine.list_tables().unwrap().iter().any(|t| t == "orders"),
            "the enclosing transaction's rollback must undo step 1's CREATE TABLE"
        );
        assert!(!is_applied(&mut engine, migration));
    }

    #[test]
    fn mid_migration_failure_without_transactions_compensates_completed_steps() {
        let (_dir, uri) = temp_uri("non_transactional_failure.db");
        let mut engine = engine_on(&uri);

        let mut migration = Migration::new("0001-autocommit-ddl", "0001-autocommit-ddl.sql", "default");
        migration.use_transactions = false;
        let mut collector = StepCollector::new();
        collector.step(
            StepPayload::Sql("CREATE TABLE widgets (id INTEGER PRIMARY KEY)".into()),
            Some(StepPayload::Sql("DROP TABLE widgets".into())),
        );
        collector.step(StepPayload::Sql("this is not valid sql".into()), None);
        migration.steps = collector.into_steps();

        let err = engine.apply_one(&migration, false).unwrap_err();
        assert!(matches!(err, stratum_migrate::Error::Database { .. }));

        assert!(
            !engine.list_tables().unwrap().iter().any(|t| t == "widgets"),
            "step 1's own rollback payload must run as a best-effort compensation"
        );
        assert!(!is_applied(&mut engine, migration));
    }

    #[test]
    fn ignore_errors_policy_lets_a_migration_apply_despite_a_failing_step() {
        let (_dir, uri) = temp_uri("ignore_errors.db");
        let mut engine = engine_on(&uri);

        let mut migration = Migration::new("0001-best-effort", "0001-best-effort.sql", "default");
        let mut collector = StepCollector::new();
        collector.step_ignoring_errors(
            StepPayload::Sql("this is not valid sql".into()),
            None,
            IgnoreErrors::Apply,
        );
        collector.step(
            StepPayload::Sql("CREATE TABLE tolerated (id INTEGER PRIMARY KEY)".into()),
            Some(StepPayload::Sql("DROP TABLE tolerated".into())),
        );
        migration.steps = collector.into_steps();

        engine.apply_one(&migration, false).unwrap();
        assert!(engine.list_tables().unwrap().iter().any(|t| t == "tolerated"));
        assert!(is_applied(&mut engine, migration));
    }

    #[test]
    fn concurrent_migrators_serialize_through_the_cross_process_lock() {
        let (_dir, uri) = temp_uri("concurrent.db");

        let config = EngineConfig::new().lock_poll_interval(Duration::from_millis(10));
        let mut engine_a = Engine::new(SqliteAdapter::connect(&uri).unwrap(), config.clone());
        let mut engine_b = Engine::new(SqliteAdapter::connect(&uri).unwrap(), config);

        let mut slow_migration = Migration::new("0001-slow", "0001-slow.sql", "default");
        let mut collector = StepCollector::new();
        collector.step(
            StepPayload::Scripted(Box::new(|backend: &mut SqliteAdapter| {
                backend.execute(
                    "CREATE TABLE slow (id INTEGER PRIMARY KEY)",
                    &std::collections::HashMap::new(),
                )?;
                thread::sleep(Duration::from_millis(150));
                Ok(())
            })),
            None,
        );
        slow_migration.steps = collector.into_steps();

        let fast_migration = create_table("0002-fast", "fast", &[]);

        let barrier = Arc::new(Barrier::new(2));
        let barrier_a = Arc::clone(&barrier);
        let barrier_b = Arc::clone(&barrier);

        let handle_a = thread::spawn(move || {
            barrier_a.wait();
            engine_a.apply_one(&slow_migration, false).unwrap();
            engine_a
        });
        let handle_b = thread::spawn(move || {
            barrier_b.wait();
            // Give thread A a head start acquiring the lock first.
            thread::sleep(Duration::from_millis(20));
            let started = std::time::Instant::now();
            engine_b.apply_one(&fast_migration, false).unwrap();
            (engine_b, started.elapsed())
        });

        let mut engine_a = handle_a.join().unwrap();
        let (mut engine_b, elapsed) = handle_b.join().unwrap();

        assert!(
            elapsed >= Duration::from_millis(100),
            "thread B's apply_one must block behind thread A's held lock, took {elapsed:?}"
        );
        assert!(engine_a.list_tables().unwrap().iter().any(|t| t == "slow"));
        assert!(engine_b.list_tables().unwrap().iter().any(|t| t == "fast"));
    }
}
