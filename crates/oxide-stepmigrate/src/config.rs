//! Migrator configuration.

use std::path::PathBuf;

use crate::checkpoint::LAST_STATE;
use crate::error::{MigrateError, Result};
use crate::loader::DEFAULT_STEP_DELIMITER;

/// Store used when none is configured.
pub const DEFAULT_STORE: &str = "sqlite";

/// Migrations directory used when none is configured.
pub const DEFAULT_MIGRATIONS_DIR: &str = "migrations";

/// Everything needed to build a [`Migrator`](crate::Migrator).
///
/// | field            | default      |
/// |------------------|--------------|
/// | `store`          | `sqlite`     |
/// | `migrations_dir` | `migrations` |
/// | `target`         | `last`       |
/// | `step_delimiter` | `--//--`     |
///
/// `database_url` has no default and must be set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateConfig {
    /// Name of the registered state store.
    pub store: String,
    /// Connection string handed to the store.
    pub database_url: String,
    /// Directory holding `<name>_up.<ext>` / `<name>_down.<ext>` scripts.
    pub migrations_dir: PathBuf,
    /// Target state for `migrate`: a migration name, `initial` or `last`.
    pub target: String,
    /// Line separating steps within a script.
    pub step_delimiter: String,
}

impl MigrateConfig {
    /// Creates a configuration with defaults for everything but the database.
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            store: DEFAULT_STORE.to_string(),
            database_url: database_url.into(),
            migrations_dir: PathBuf::from(DEFAULT_MIGRATIONS_DIR),
            target: LAST_STATE.to_string(),
            step_delimiter: DEFAULT_STEP_DELIMITER.to_string(),
        }
    }

    /// Sets the store name.
    #[must_use]
    pub fn store(mut self, store: impl Into<String>) -> Self {
        self.store = store.into();
        self
    }

    /// Sets the migrations directory.
    #[must_use]
    pub fn migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = dir.into();
        self
    }

    /// Sets the target state.
    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Sets the step delimiter line.
    #[must_use]
    pub fn step_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.step_delimiter = delimiter.into();
        self
    }

    /// Rejects empty required fields.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("store", &self.store),
            ("database_url", &self.database_url),
            ("target", &self.target),
            ("step_delimiter", &self.step_delimiter),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(MigrateError::InvalidArgument {
                    name,
                    message: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MigrateConfig::new("sqlite://app.db");
        assert_eq!(config.store, "sqlite");
        assert_eq!(config.target, "last");
        assert_eq!(config.migrations_dir, PathBuf::from("migrations"));
        assert_eq!(config.step_delimiter, "--//--");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = MigrateConfig::new("db")
            .store("memory")
            .migrations_dir("sql")
            .target("initial");
        assert_eq!(config.store, "memory");
        assert_eq!(config.migrations_dir, PathBuf::from("sql"));
        assert_eq!(config.target, "initial");
    }

    #[test]
    fn test_validate_rejects_empty_url() {
        let err = MigrateConfig::new("").validate().unwrap_err();
        assert!(matches!(
            err,
            MigrateError::InvalidArgument { name: "database_url", .. }
        ));
    }
}
