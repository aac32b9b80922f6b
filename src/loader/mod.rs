//! Migration discovery: resolves sources into files, parses directives and
//! statements, pairs rollback files, and resolves dependency tokens into a
//! loaded [`MigrationSet`].

pub mod sql;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::warn;

use crate::backend::BackendAdapter;
use crate::error::Error;
use crate::migration::{Migration, MigrationSet};
use crate::step::{ScriptedMigration, StepCollector, StepPayload};

/// Files created by the (out-of-scope) "new migration" front-end begin
/// with this prefix and are ignored by the loader.
const RESERVED_TEMP_PREFIX: &str = ".~";

/// A compile-time stand-in for a package-data migration resource: an id
/// paired with its SQL and optional rollback SQL, baked into the binary.
pub struct EmbeddedFile {
    pub id: &'static str,
    pub sql: &'static str,
    pub rollback_sql: Option<&'static str>,
}

/// Where to look for migrations.
pub enum Source<'a, B: BackendAdapter> {
    /// A filesystem glob; every matching directory contributes its
    /// migration files, enumerated in lexicographic order.
    Directory(PathBuf),
    /// A compile-time embedded resource list, for binaries that ship their
    /// migrations without touching the filesystem at runtime.
    Embedded(&'static [EmbeddedFile]),
    /// Scripted migrations, registered programmatically rather than
    /// discovered on disk: Rust has no runtime `exec()` of source files, so
    /// a "scripted migration file" is simply a linked-in value.
    Scripted(Vec<(&'a str, Box<dyn ScriptedMigration<B>>)>),
}

/// Load migrations from every given source into one [`MigrationSet`],
/// resolving dependency tokens across the whole set in a second pass so no
/// global registry is required.
pub fn read_migrations<B: BackendAdapter>(sources: Vec<Source<'_, B>>) -> Result<MigrationSet<B>, Error> {
    let mut set = MigrationSet::new();

    for source in sources {
        match source {
            Source::Directory(glob_pattern) => {
                for dir in resolve_directories(&glob_pattern)? {
                    load_directory(&dir, &mut set)?;
                }
            }
            Source::Embedded(files) => {
                for file in files {
                    let migration = build_sql_migration(
                        file.id.to_string(),
                        PathBuf::from(format!("<embedded>/{}", file.id)),
                        "embedded".to_string(),
                        file.sql,
                        file.rollback_sql,
                    )?;
                    set.insert(migration)?;
                }
            }
            Source::Scripted(migrations) => {
                for (id, scripted) in migrations {
                    let migration = build_scripted_migration(id.to_string(), scripted)?;
                    set.insert(migration)?;
                }
            }
        }
    }

    resolve_dependencies(&set)?;
    Ok(set)
}

fn resolve_directories(pattern: &Path) -> Result<Vec<PathBuf>, Error> {
    let pattern_str = pattern.to_string_lossy();
    let mut dirs: Vec<PathBuf> = glob::glob(&pattern_str)
        .map_err(|err| Error::InvalidSource {
            path: pattern.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, err),
        })?
        .filter_map(|entry| entry.ok())
        .filter(|p| p.is_dir())
        .collect();
    if dirs.is_empty() && pattern.is_dir() {
        dirs.push(pattern.to_path_buf());
    }
    dirs.sort();
    Ok(dirs)
}

fn load_directory<B: BackendAdapter>(dir: &Path, set: &mut MigrationSet<B>) -> Result<(), Error> {
    let mut entries: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.path().to_path_buf())
        .collect();
    entries.sort();

    let source_group = dir.to_string_lossy().to_string();

    for path in &entries {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if file_name.starts_with(RESERVED_TEMP_PREFIX) {
            continue;
        }
        if file_name.ends_with(".rollback.sql") {
            continue; // paired in below, not a migration in its own right
        }
        if !file_name.ends_with(".sql") {
            continue;
        }

        let id = file_name.trim_end_matches(".sql").to_string();
        let rollback_path = path.with_file_name(format!("{id}.rollback.sql"));
        let sql = std::fs::read_to_string(path).map_err(|source| Error::InvalidSource {
            path: path.clone(),
            source,
        })?;
        let rollback_sql = std::fs::read_to_string(&rollback_path).ok();

        let migration = build_sql_migration(
            id,
            path.clone(),
            source_group.clone(),
            &sql,
            rollback_sql.as_deref(),
        )?;
        set.insert(migration)?;
    }

    Ok(())
}

fn build_sql_migration<B: BackendAdapter>(
    id: String,
    path: PathBuf,
    source_group: String,
    sql: &str,
    rollback_sql: Option<&str>,
) -> Result<Migration<B>, Error> {
    let apply_statements = sql::split_statements(sql);
    let mut rollback_statements = rollback_sql.map(sql::split_statements).unwrap_or_default();
    rollback_statements.reverse();

    let (directives, doc, first_apply) = match apply_statements.first() {
        Some(first) => sql::parse_leading_directives(first),
        None => (sql::Directives::default(), String::new(), String::new()),
    };

    let mut apply_statements = apply_statements;
    if let Some(first) = apply_statements.first_mut() {
        *first = first_apply;
    }

    let mut migration = Migration::new(id.clone(), path.clone(), source_group);
    migration.use_transactions = directives.transactional.unwrap_or(true);
    migration.depends = directives.depends;
    migration.doc = doc;

    let mut collector = StepCollector::new();
    for (i, apply) in apply_statements.iter().enumerate() {
        if apply.trim().is_empty() {
            continue;
        }
        let rollback = rollback_statements.get(i).filter(|s| !s.trim().is_empty());
        collector.step(
            StepPayload::Sql(apply.clone()),
            rollback.map(|s| StepPayload::Sql(s.clone())),
        );
    }
    migration.steps = collector.into_steps();

    if migration.steps.is_empty() && sql.trim().is_empty() {
        return Err(Error::bad_migration(path, "migration file is empty"));
    }

    Ok(migration)
}

fn build_scripted_migration<B: BackendAdapter>(
    id: String,
    scripted: Box<dyn ScriptedMigration<B>>,
) -> Result<Migration<B>, Error> {
    let mut migration = Migration::new(id.clone(), PathBuf::from(format!("<scripted>/{id}")), "scripted".to_string());
    migration.use_transactions = scripted.use_transactions();
    migration.depends = scripted.depends().iter().map(|s| s.to_string()).collect();

    let mut collector = StepCollector::new();
    scripted.build(&mut collector);
    migration.steps = collector.into_steps();
    Ok(migration)
}

/// Check every `depends` token against the set being built; dangling
/// references are a load error. (Full ordering is the topological sort's
/// job; this only verifies the tokens resolve to *something* loaded.)
fn resolve_dependencies<B: BackendAdapter>(set: &MigrationSet<B>) -> Result<(), Error> {
    let mut known: HashMap<&str, ()> = HashMap::new();
    for m in set.items.iter().chain(set.post_apply.iter()) {
        known.insert(&m.id, ());
    }
    for m in set.items.iter().chain(set.post_apply.iter()) {
        for dep in &m.depends {
            if !known.contains_key(dep.as_str()) {
                return Err(Error::bad_migration(
                    m.path.clone(),
                    format!("depends on unknown migration {dep:?}"),
                ));
            }
        }
    }
    if set.is_empty() {
        warn!("no migrations found");
    }
    Ok(())
}
