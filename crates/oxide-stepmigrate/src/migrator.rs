//! The migrator: loaded scripts bound to one target database.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, HistoryEntry, LAST_STATE};
use crate::config::MigrateConfig;
use crate::error::{MigrateError, Result};
use crate::executor::execute_step;
use crate::history::{check_history, upgrade_migration_info};
use crate::loader::ScriptLoader;
use crate::migration::MigrationSet;
use crate::store::{StateStore, StoreConnection, StoreRegistry};
use crate::traversal::plan;

/// Outcome of a [`Migrator::migrate_to`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Checkpoint read before any step ran.
    pub from: Checkpoint,
    /// Checkpoint after the last step.
    pub to: Checkpoint,
    /// Number of steps executed.
    pub steps: usize,
    /// Whether a legacy checkpoint was upgraded first.
    pub upgraded: bool,
}

impl MigrationReport {
    /// Returns true if nothing was executed.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.steps == 0
    }
}

/// Moves one database between the states defined by a script directory.
///
/// Construction loads and validates every script up front; no connection is
/// held between calls. Each call opens one connection and closes it on every
/// exit path.
pub struct Migrator {
    store: Arc<dyn StateStore>,
    database_url: String,
    migrations: MigrationSet,
    target: String,
}

impl fmt::Debug for Migrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migrator")
            .field("store", &self.store.name())
            .field("migrations", &self.migrations.names())
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl Migrator {
    /// Builds a migrator from configuration.
    ///
    /// Fails before touching the database if the store is not registered,
    /// the migration scripts do not load or the configured target does not
    /// name a loaded migration.
    pub fn new(config: &MigrateConfig, registry: &StoreRegistry) -> Result<Self> {
        config.validate()?;
        let store = registry.get(&config.store)?;
        let loader = ScriptLoader::new(&config.migrations_dir).delimiter(config.step_delimiter.clone());
        let migrations = loader.load()?;
        migrations.resolve_target(&config.target)?;

        info!(
            store = store.name(),
            migrations = migrations.len(),
            dir = %loader.dir().display(),
            target = %config.target,
            "Migrator ready"
        );
        Ok(Self::with_migrations(store, config.database_url.clone(), migrations)
            .target(config.target.clone()))
    }

    /// Builds a migrator around an already loaded set, targeting `last`.
    #[must_use]
    pub fn with_migrations(
        store: Arc<dyn StateStore>,
        database_url: impl Into<String>,
        migrations: MigrationSet,
    ) -> Self {
        Self {
            store,
            database_url: database_url.into(),
            migrations,
            target: LAST_STATE.to_string(),
        }
    }

    /// Sets the target used by [`migrate`](Self::migrate).
    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Target used by [`migrate`](Self::migrate).
    #[must_use]
    pub fn configured_target(&self) -> &str {
        &self.target
    }

    /// The loaded migrations.
    #[must_use]
    pub fn migrations(&self) -> &MigrationSet {
        &self.migrations
    }

    /// Migration names in ascending order.
    #[must_use]
    pub fn migration_names(&self) -> &[String] {
        self.migrations.names()
    }

    /// Name of the store in use.
    #[must_use]
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Reads the stored checkpoint without changing anything.
    ///
    /// A legacy-format database reports its single marker. A database that
    /// does not exist is an error rather than the initial state.
    pub async fn current_checkpoint(&self) -> Result<Checkpoint> {
        let mut conn = self.connect_read_only().await?;
        let outcome = read_checkpoint(conn.as_mut()).await;
        release(conn, outcome).await
    }

    /// Current state as `(human state, substate)`; `initial` when nothing is applied.
    pub async fn current_state(&self) -> Result<(String, i64)> {
        let checkpoint = self.current_checkpoint().await?;
        Ok((checkpoint.human_state().to_string(), checkpoint.substate))
    }

    /// Moves the database to the configured target.
    pub async fn migrate(&self) -> Result<MigrationReport> {
        self.migrate_to(&self.target).await
    }

    /// Moves the database to `target`: a migration name, `initial` or `last`.
    ///
    /// Every step commits on its own. After a failure the database is left at
    /// the last committed step and calling again resumes from there.
    pub async fn migrate_to(&self, target: &str) -> Result<MigrationReport> {
        let target_index = self.migrations.resolve_target(target)?;
        let mut conn = self.connect().await?;
        let outcome = self.migrate_with(conn.as_mut(), target, target_index).await;
        release(conn, outcome).await
    }

    /// Reads the raw history log, oldest first.
    pub async fn history(&self) -> Result<Vec<HistoryEntry>> {
        let mut conn = self.connect_read_only().await?;
        let outcome = conn.history().await;
        release(conn, outcome).await
    }

    /// Replays the history log and checks it against the loaded migrations
    /// and the stored checkpoint.
    ///
    /// Returns the checkpoint the log implies. A legacy-format database has
    /// no log yet, so only its marker is validated.
    pub async fn verify_history(&self) -> Result<Checkpoint> {
        let mut conn = self.connect_read_only().await?;
        let outcome = self.verify_with(conn.as_mut()).await;
        release(conn, outcome).await
    }

    async fn connect(&self) -> Result<Box<dyn StoreConnection>> {
        self.store.connect(&self.database_url).await
    }

    async fn connect_read_only(&self) -> Result<Box<dyn StoreConnection>> {
        self.store.connect_read_only(&self.database_url).await
    }

    async fn migrate_with(
        &self,
        conn: &mut dyn StoreConnection,
        target: &str,
        target_index: Option<usize>,
    ) -> Result<MigrationReport> {
        let transactional = self.store.supports_transactions();
        let upgraded = upgrade_migration_info(conn, transactional, &self.migrations).await?;
        let from = conn.checkpoint().await?;
        let steps = plan(&self.migrations, &from, target_index)?;

        if steps.is_empty() {
            info!(state = %from.human_state(), "Database already at target state");
            return Ok(MigrationReport {
                to: from.clone(),
                from,
                steps: 0,
                upgraded,
            });
        }

        info!(from = %from, to = target, steps = steps.len(), "Migrating database");
        for step in &steps {
            execute_step(conn, transactional, step).await?;
        }

        let to = steps
            .last()
            .map_or_else(|| from.clone(), |step| step.to.clone());
        info!(state = %to.human_state(), substate = to.substate, "Migration complete");
        Ok(MigrationReport {
            from,
            to,
            steps: steps.len(),
            upgraded,
        })
    }

    async fn verify_with(&self, conn: &mut dyn StoreConnection) -> Result<Checkpoint> {
        if conn.is_legacy_format().await? {
            let marker = conn.legacy_checkpoint().await?;
            self.migrations.validate_checkpoint(&marker)?;
            return Ok(marker);
        }

        let history = conn.history().await?;
        let implied = check_history(&self.migrations, &history)?;
        let stored = conn.checkpoint().await?;
        if implied != stored {
            return Err(MigrateError::StateDrift {
                expected: implied,
                actual: stored,
            });
        }
        info!(entries = history.len(), state = %implied, "History verified");
        Ok(implied)
    }
}

async fn read_checkpoint(conn: &mut dyn StoreConnection) -> Result<Checkpoint> {
    if conn.is_legacy_format().await? {
        conn.legacy_checkpoint().await
    } else {
        conn.checkpoint().await
    }
}

/// Closes `conn` and returns `outcome`, preferring the body's error over a
/// close error.
async fn release<T>(conn: Box<dyn StoreConnection>, outcome: Result<T>) -> Result<T> {
    match (outcome, conn.close().await) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) | (Err(err), Ok(())) => Err(err),
        (Err(err), Err(close_err)) => {
            warn!(error = %close_err, "Failed to close connection");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Direction;
    use crate::migration::Migration;
    use crate::store::MemoryStore;

    fn set_of(names: &[(&str, usize)]) -> MigrationSet {
        MigrationSet::new(names.iter().map(|(name, steps)| {
            (0..*steps).fold(Migration::new(*name), |m, i| {
                m.step(format!("up {name} {i}"), format!("down {name} {i}"))
            })
        }))
        .unwrap()
    }

    fn migrator(store: &MemoryStore, names: &[(&str, usize)]) -> Migrator {
        Migrator::with_migrations(Arc::new(store.clone()), "db", set_of(names))
    }

    fn scripts_dir(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        for name in names {
            std::fs::write(dir.path().join(format!("{name}_up.sql")), format!("up {name}")).unwrap();
            std::fs::write(dir.path().join(format!("{name}_down.sql")), format!("down {name}")).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_fresh_database_is_initial() {
        let store = MemoryStore::new();
        store.update("db", |_| ());
        let migrator = migrator(&store, &[("A", 1)]);
        assert_eq!(
            migrator.current_state().await.unwrap(),
            ("initial".to_string(), 0)
        );
    }

    #[tokio::test]
    async fn test_reading_missing_database_fails() {
        let store = MemoryStore::new();
        let migrator = migrator(&store, &[("A", 1)]);

        assert!(migrator.current_state().await.is_err());
        assert!(migrator.history().await.is_err());
        assert!(migrator.verify_history().await.is_err());
        assert!(!store.exists("db"));
    }

    #[tokio::test]
    async fn test_migrate_uses_configured_target() {
        let dir = scripts_dir(&["0001", "0002", "0003"]);
        let store = MemoryStore::new();
        let registry = StoreRegistry::new().with(Arc::new(store.clone()));
        let config = MigrateConfig::new("db")
            .store("memory")
            .migrations_dir(dir.path())
            .target("0002");

        let migrator = Migrator::new(&config, &registry).unwrap();
        assert_eq!(migrator.store_name(), "memory");
        assert_eq!(migrator.configured_target(), "0002");

        let report = migrator.migrate().await.unwrap();
        assert_eq!(report.to, Checkpoint::at("0002", 0));
        assert_eq!(store.database("db").executed, ["up 0001", "up 0002"]);
    }

    #[test]
    fn test_unknown_configured_target_fails_construction() {
        let dir = scripts_dir(&["0001"]);
        let config = MigrateConfig::new("db")
            .store("memory")
            .migrations_dir(dir.path())
            .target("0009");

        let err = Migrator::new(&config, &StoreRegistry::builtin()).unwrap_err();
        assert!(matches!(err, MigrateError::UnknownState(name) if name == "0009"));
    }

    #[tokio::test]
    async fn test_default_target_is_last() {
        let store = MemoryStore::new();
        let migrator = migrator(&store, &[("A", 1), ("B", 1)]);
        assert_eq!(migrator.configured_target(), "last");

        let report = migrator.migrate().await.unwrap();
        assert_eq!(report.to, Checkpoint::at("B", 0));
    }

    #[tokio::test]
    async fn test_migrate_to_last_and_back() {
        let store = MemoryStore::new();
        let migrator = migrator(&store, &[("A", 2), ("B", 1)]);

        let report = migrator.migrate_to("last").await.unwrap();
        assert_eq!(report.steps, 3);
        assert_eq!(report.to, Checkpoint::at("B", 0));
        assert!(!report.upgraded);

        let report = migrator.migrate_to("initial").await.unwrap();
        assert_eq!(report.steps, 3);
        assert!(report.to.is_initial());
        assert_eq!(migrator.verify_history().await.unwrap(), Checkpoint::initial());
    }

    #[tokio::test]
    async fn test_unknown_target_fails_before_connecting() {
        let store = MemoryStore::new();
        store.update("db", |db| db.checkpoint = Some(Checkpoint::at("gone", 0)));
        let migrator = migrator(&store, &[("A", 1)]);

        let err = migrator.migrate_to("Z").await.unwrap_err();
        assert!(matches!(err, MigrateError::UnknownState(name) if name == "Z"));
    }

    #[tokio::test]
    async fn test_unknown_database_state() {
        let store = MemoryStore::new();
        store.update("db", |db| db.checkpoint = Some(Checkpoint::at("gone", 0)));
        let migrator = migrator(&store, &[("A", 1)]);

        let err = migrator.migrate_to("A").await.unwrap_err();
        assert!(matches!(err, MigrateError::UnknownDatabaseState(name) if name == "gone"));
        assert!(store.database("db").executed.is_empty());
    }

    #[tokio::test]
    async fn test_legacy_state_is_reported_then_upgraded() {
        let store = MemoryStore::new();
        store.update("db", |db| db.legacy_marker = Some(Checkpoint::at("A", 0)));
        let migrator = migrator(&store, &[("A", 1), ("B", 1)]);

        assert_eq!(migrator.current_state().await.unwrap(), ("A".to_string(), 0));

        let report = migrator.migrate_to("last").await.unwrap();
        assert!(report.upgraded);
        assert_eq!(report.steps, 1);
        assert_eq!(store.database("db").executed, vec!["up B 0"]);
        assert_eq!(migrator.verify_history().await.unwrap(), Checkpoint::at("B", 0));
    }

    #[tokio::test]
    async fn test_verify_detects_checkpoint_mismatch() {
        let store = MemoryStore::new();
        let migrator = migrator(&store, &[("A", 1), ("B", 1)]);
        migrator.migrate_to("A").await.unwrap();
        store.update("db", |db| db.checkpoint = Some(Checkpoint::at("B", 0)));

        let err = migrator.verify_history().await.unwrap_err();
        assert!(matches!(err, MigrateError::StateDrift { .. }));
    }

    #[tokio::test]
    async fn test_history_is_recorded() {
        let store = MemoryStore::new();
        let migrator = migrator(&store, &[("A", 2)]);
        migrator.migrate_to("A").await.unwrap();
        migrator.migrate_to("initial").await.unwrap();

        let directions: Vec<_> = migrator
            .history()
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.substate, e.direction))
            .collect();
        assert_eq!(
            directions,
            [
                (1, Direction::Up),
                (0, Direction::Up),
                (0, Direction::Down),
                (1, Direction::Down),
            ]
        );
    }
}
