//! Error types for the migration system.

use std::path::PathBuf;

use crate::checkpoint::Checkpoint;

/// Broad classes of failure, used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad construction input: unknown store, missing argument.
    Configuration,
    /// The migrations directory could not be turned into a migration set.
    Load,
    /// A target or stored state name is not part of the loaded set.
    Resolution,
    /// A stored substate is out of range for its migration.
    Validity,
    /// The database failed while a step was running.
    Execution,
    /// The database state does not match what this process expected.
    Consistency,
}

/// Errors that can occur during migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// No store is registered under this name.
    #[error("State store '{0}' is not registered")]
    UnknownStore(String),

    /// A required argument was empty.
    #[error("Invalid argument '{name}': {message}")]
    InvalidArgument {
        /// Argument name.
        name: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// No migrations directory found.
    #[error("Migrations directory not found: {0}")]
    MigrationsDirNotFound(PathBuf),

    /// The migrations directory could not be listed.
    #[error("Cannot load migrations from '{path}': {source}")]
    DirectoryUnreadable {
        /// Directory path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A script file could not be read.
    #[error("Script '{path}' cannot be loaded: {source}")]
    ScriptUnreadable {
        /// Path to the script.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// One half of an up/down script pair is absent.
    #[error("Migration script '{script}' is absent for migration '{migration}'")]
    MissingScript {
        /// Migration name.
        migration: String,
        /// Expected file name of the missing script.
        script: String,
    },

    /// Up and down scripts split into a different number of steps.
    #[error("Migration '{migration}' has {up} up steps but {down} down steps")]
    StepCountMismatch {
        /// Migration name.
        migration: String,
        /// Number of up steps.
        up: usize,
        /// Number of down steps.
        down: usize,
    },

    /// A script pair contains no steps at all.
    #[error("Migration '{0}' contains no steps")]
    EmptyMigration(String),

    /// Two files resolve to the same migration name and direction.
    #[error("Duplicate migration script: {0}")]
    DuplicateScript(PathBuf),

    /// A requested target is not a known migration.
    #[error("State '{0}' does not exist")]
    UnknownState(String),

    /// The database points at a migration that is not loaded.
    #[error("Database is in unknown state '{0}'")]
    UnknownDatabaseState(String),

    /// A substate lies outside the step range of its migration.
    #[error("Substate {substate} is not applicable to state '{state}' with {step_count} steps")]
    SubstateNotApplicable {
        /// Migration name.
        state: String,
        /// Offending substate.
        substate: i64,
        /// Step count of the migration.
        step_count: usize,
    },

    /// The checkpoint moved underneath this process.
    #[error("Database state drifted: expected {expected}, found {actual}")]
    StateDrift {
        /// Checkpoint this process last committed or read.
        expected: Checkpoint,
        /// Checkpoint found in the database.
        actual: Checkpoint,
    },

    /// The history log does not replay into the loaded migration set.
    #[error("Migration history is corrupt: {0}")]
    CorruptHistory(String),

    /// Database error during migration execution.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Failure reported by a store that does not speak sqlx.
    #[error("Store '{store}' failed: {message}")]
    Backend {
        /// Store name.
        store: &'static str,
        /// Error message.
        message: String,
    },
}

impl MigrateError {
    /// Returns the category this error belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownStore(_) | Self::InvalidArgument { .. } => ErrorCategory::Configuration,
            Self::MigrationsDirNotFound(_)
            | Self::DirectoryUnreadable { .. }
            | Self::ScriptUnreadable { .. }
            | Self::MissingScript { .. }
            | Self::StepCountMismatch { .. }
            | Self::EmptyMigration(_)
            | Self::DuplicateScript(_) => ErrorCategory::Load,
            Self::UnknownState(_) | Self::UnknownDatabaseState(_) => ErrorCategory::Resolution,
            Self::SubstateNotApplicable { .. } => ErrorCategory::Validity,
            Self::Database(_) | Self::Backend { .. } => ErrorCategory::Execution,
            Self::StateDrift { .. } | Self::CorruptHistory(_) => ErrorCategory::Consistency,
        }
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
