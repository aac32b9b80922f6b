//! Programmatic engine configuration.
//!
//! This is deliberately not a file format or a loader: reading TOML/INI
//! from disk and merging several sources is a front-end concern. The
//! engine only ever receives a fully-resolved [`EngineConfig`] value.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub migration_table: String,
    pub log_table: String,
    pub lock_table: String,
    pub version_table: String,
    pub lock_timeout: Duration,
    pub lock_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            migration_table: "_migration_ledger".to_string(),
            log_table: "_migration_log".to_string(),
            lock_table: "_migration_lock".to_string(),
            version_table: "_migration_schema_version".to_string(),
            lock_timeout: Duration::from_secs(10),
            lock_poll_interval: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn migration_table(mut self, name: impl Into<String>) -> Self {
        self.migration_table = name.into();
        self
    }

    pub fn log_table(mut self, name: impl Into<String>) -> Self {
        self.log_table = name.into();
        self
    }

    pub fn lock_table(mut self, name: impl Into<String>) -> Self {
        self.lock_table = name.into();
        self
    }

    pub fn version_table(mut self, name: impl Into<String>) -> Self {
        self.version_table = name.into();
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_names_match_external_interface() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.migration_table, "_migration_ledger");
        assert_eq!(cfg.log_table, "_migration_log");
        assert_eq!(cfg.lock_table, "_migration_lock");
        assert_eq!(cfg.version_table, "_migration_schema_version");
    }

    #[test]
    fn builder_overrides_table_names() {
        let cfg = EngineConfig::new().migration_table("custom_migrations");
        assert_eq!(cfg.migration_table, "custom_migrations");
        assert_eq!(cfg.log_table, "_migration_log");
    }
}
