//! State store implementations.
//!
//! A store knows how one database engine persists the checkpoint, the legacy
//! single-marker checkpoint and the history log. The migration engine never
//! issues engine-specific SQL itself; it only runs script steps through the
//! connection a store hands out.

mod memory;
mod sqlite;

pub use memory::{MemoryDatabase, MemoryStore};
pub use sqlite::SqliteStore;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::checkpoint::{Checkpoint, Direction, HistoryEntry};
use crate::error::{MigrateError, Result};

/// A database engine adapter.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns the name the store is registered under.
    fn name(&self) -> &'static str;

    /// Returns whether steps can be wrapped in a transaction.
    fn supports_transactions(&self) -> bool;

    /// Opens a connection to the target database, creating the database
    /// and its state tables if needed.
    async fn connect(&self, database_url: &str) -> Result<Box<dyn StoreConnection>>;

    /// Opens a connection that only reads. Fails if the database does not
    /// exist and never creates anything.
    async fn connect_read_only(&self, database_url: &str) -> Result<Box<dyn StoreConnection>>;
}

/// One open connection to a target database.
///
/// While a transaction is open (between [`begin`](Self::begin) and
/// [`commit`](Self::commit)/[`rollback`](Self::rollback)), every other
/// operation runs inside it.
#[async_trait]
pub trait StoreConnection: Send {
    /// Starts a transaction.
    async fn begin(&mut self) -> Result<()>;

    /// Commits the open transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Rolls the open transaction back.
    async fn rollback(&mut self) -> Result<()>;

    /// Executes the SQL of one step.
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Reads the current checkpoint in the history format.
    async fn checkpoint(&mut self) -> Result<Checkpoint>;

    /// Persists a new checkpoint in the history format.
    async fn set_checkpoint(&mut self, checkpoint: &Checkpoint, direction: Direction) -> Result<()>;

    /// Returns true while the database still carries the legacy single marker.
    async fn is_legacy_format(&mut self) -> Result<bool>;

    /// Reads the legacy single-marker checkpoint.
    async fn legacy_checkpoint(&mut self) -> Result<Checkpoint>;

    /// Appends entries to the history log, in order.
    async fn append_history(&mut self, entries: &[HistoryEntry]) -> Result<()>;

    /// Returns the history log, oldest first.
    async fn history(&mut self) -> Result<Vec<HistoryEntry>>;

    /// Releases the connection.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Commits on success and rolls back on failure when `transactional`.
///
/// The outcome of the body is returned unchanged; a failing rollback is
/// logged so the original error is not masked.
pub async fn finish_transaction<T>(
    conn: &mut dyn StoreConnection,
    transactional: bool,
    outcome: Result<T>,
) -> Result<T> {
    if !transactional {
        return outcome;
    }
    match outcome {
        Ok(value) => {
            conn.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = conn.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}

/// Explicit map of store name to store.
///
/// Built at configuration time and handed to the migrator; there is no
/// process-wide registration.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    stores: BTreeMap<&'static str, Arc<dyn StateStore>>,
}

impl StoreRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the stores shipped with this crate.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new()
            .with(Arc::new(SqliteStore::new()))
            .with(Arc::new(MemoryStore::new()))
    }

    /// Registers a store, replacing any store with the same name.
    #[must_use]
    pub fn with(mut self, store: Arc<dyn StateStore>) -> Self {
        self.register(store);
        self
    }

    /// Registers a store, replacing any store with the same name.
    pub fn register(&mut self, store: Arc<dyn StateStore>) {
        self.stores.insert(store.name(), store);
    }

    /// Looks a store up by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn StateStore>> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| MigrateError::UnknownStore(name.to_string()))
    }

    /// Registered store names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.stores.keys().copied()
    }
}

impl fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.stores.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = StoreRegistry::builtin();
        assert_eq!(registry.names().collect::<Vec<_>>(), ["memory", "sqlite"]);
        assert!(registry.get("sqlite").unwrap().supports_transactions());
    }

    #[test]
    fn test_unknown_store() {
        let registry = StoreRegistry::new();
        assert!(matches!(
            registry.get("oracle"),
            Err(MigrateError::UnknownStore(name)) if name == "oracle"
        ));
    }

    #[test]
    fn test_register_replaces() {
        let registry = StoreRegistry::new()
            .with(Arc::new(MemoryStore::new()))
            .with(Arc::new(MemoryStore::new().without_transactions()));
        assert!(!registry.get("memory").unwrap().supports_transactions());
    }

    #[tokio::test]
    async fn test_finish_transaction_rolls_back() {
        let store = MemoryStore::new();
        let mut conn = store.connect("db").await.unwrap();

        conn.begin().await.unwrap();
        conn.execute("CREATE TABLE t (id INT)").await.unwrap();
        let outcome: Result<()> = Err(MigrateError::CorruptHistory("boom".into()));
        assert!(finish_transaction(conn.as_mut(), true, outcome).await.is_err());

        assert!(store.database("db").executed.is_empty());
    }
}
