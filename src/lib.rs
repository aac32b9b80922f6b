pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod loader;
pub mod lock;
pub mod migration;
mod param;
mod sort;
pub mod step;
mod value;

pub use crate::backend::BackendAdapter;
pub use crate::config::EngineConfig;
pub use crate::engine::Engine;
pub use crate::error::Error;
pub use crate::ledger::Operation;
pub use crate::loader::{read_migrations, EmbeddedFile, Source};
pub use crate::migration::{Migration, MigrationSet};
pub use crate::step::{IgnoreErrors, ScriptedMigration, StepCollector, StepPayload};
pub use crate::value::{QueryResult, Row, Value};

#[cfg(feature = "sqlite")]
pub use crate::backend::sqlite::SqliteAdapter;

#[cfg(feature = "sqlite")]
pub use rusqlite;
