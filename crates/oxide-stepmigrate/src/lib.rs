//! Resumable, step-checkpointed SQL script migrations.
//!
//! `oxide-stepmigrate` moves a database between named schema states defined
//! by plain SQL scripts in a directory:
//! - Every migration is a pair of `<name>_up.<ext>` / `<name>_down.<ext>` files
//! - Each script is split into steps on a delimiter line (`--//--` by default)
//! - The database stores a `(state, substate)` checkpoint after every step, so
//!   an interrupted run resumes where it stopped instead of restarting
//!
//! # Architecture
//!
//! - **Loader** - Reads the script directory into a [`MigrationSet`]
//! - **Traversal** - Plans the ordered steps between two checkpoints
//! - **Executor** - Runs one step and records its checkpoint atomically
//! - **History** - Upgrades legacy single-marker databases and verifies the log
//! - **Store** - Per-engine persistence of the checkpoint and history
//!
//! # Example
//!
//! ```rust,ignore
//! use oxide_stepmigrate::prelude::*;
//!
//! let config = MigrateConfig::new("sqlite://app.db").migrations_dir("migrations");
//! let migrator = Migrator::new(&config, &StoreRegistry::builtin())?;
//!
//! migrator.migrate_to("last").await?;
//! let (state, substate) = migrator.current_state().await?;
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Show the current state
//! stepmigrate --database sqlite://app.db state
//!
//! # Apply every migration
//! stepmigrate --database sqlite://app.db migrate
//!
//! # Revert everything
//! stepmigrate --database sqlite://app.db migrate --to initial
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod executor;
pub mod history;
pub mod loader;
pub mod migration;
pub mod migrator;
pub mod store;
pub mod traversal;

pub use checkpoint::{Checkpoint, Direction, HistoryEntry};
pub use config::MigrateConfig;
pub use error::{ErrorCategory, MigrateError, Result};
pub use migration::{Migration, MigrationSet, MigrationStep};
pub use migrator::{MigrationReport, Migrator};
pub use store::{StateStore, StoreConnection, StoreRegistry};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::checkpoint::{Checkpoint, Direction, HistoryEntry, INITIAL_STATE, LAST_STATE};
    pub use crate::config::MigrateConfig;
    pub use crate::error::{ErrorCategory, MigrateError, Result};
    pub use crate::loader::{load_migrations, ScriptLoader};
    pub use crate::migration::{Migration, MigrationSet, MigrationStep};
    pub use crate::migrator::{MigrationReport, Migrator};
    pub use crate::store::{MemoryStore, SqliteStore, StateStore, StoreConnection, StoreRegistry};
}
