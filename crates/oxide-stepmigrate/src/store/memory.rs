//! In-process state store.
//!
//! Databases live in memory, keyed by URL, and survive across connections of
//! the same store value. Executed SQL is recorded instead of run, which makes
//! this store useful for exercising the traversal without an engine. Failures
//! can be injected per SQL fragment.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::checkpoint::{Checkpoint, Direction, HistoryEntry};
use crate::error::{MigrateError, Result};

use super::{StateStore, StoreConnection};

const STORE_NAME: &str = "memory";

/// Contents of one in-memory database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryDatabase {
    /// Checkpoint in the history format, `None` until first written.
    pub checkpoint: Option<Checkpoint>,
    /// Legacy single-marker checkpoint, if the database still has one.
    pub legacy_marker: Option<Checkpoint>,
    /// History log, oldest first.
    pub history: Vec<HistoryEntry>,
    /// SQL executed against the database, in order.
    pub executed: Vec<String>,
    /// Every checkpoint written, in order.
    pub checkpoint_writes: Vec<Checkpoint>,
}

#[derive(Debug, Default)]
struct Shared {
    databases: HashMap<String, MemoryDatabase>,
    failures: Vec<String>,
}

/// State store keeping databases in process memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
    transactional: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a transactional memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            transactional: true,
        }
    }

    /// Disables transaction support.
    #[must_use]
    pub fn without_transactions(mut self) -> Self {
        self.transactional = false;
        self
    }

    /// Returns a copy of a database's contents.
    #[must_use]
    pub fn database(&self, url: &str) -> MemoryDatabase {
        self.shared
            .lock()
            .databases
            .get(url)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns true once a database has been created under `url`.
    #[must_use]
    pub fn exists(&self, url: &str) -> bool {
        self.shared.lock().databases.contains_key(url)
    }

    fn connection(&self, url: &str) -> MemoryConnection {
        MemoryConnection {
            shared: Arc::clone(&self.shared),
            url: url.to_string(),
            transactional: self.transactional,
            snapshot: None,
        }
    }

    /// Mutates a database in place, creating it if needed.
    pub fn update<R>(&self, url: &str, f: impl FnOnce(&mut MemoryDatabase) -> R) -> R {
        let mut shared = self.shared.lock();
        f(shared.databases.entry(url.to_string()).or_default())
    }

    /// Makes every execution of SQL containing `fragment` fail.
    pub fn fail_on(&self, fragment: impl Into<String>) {
        self.shared.lock().failures.push(fragment.into());
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        self.shared.lock().failures.clear();
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn name(&self) -> &'static str {
        STORE_NAME
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    async fn connect(&self, database_url: &str) -> Result<Box<dyn StoreConnection>> {
        self.update(database_url, |_| ());
        Ok(Box::new(self.connection(database_url)))
    }

    async fn connect_read_only(&self, database_url: &str) -> Result<Box<dyn StoreConnection>> {
        if !self.exists(database_url) {
            return Err(backend(format!("database '{database_url}' does not exist")));
        }
        Ok(Box::new(self.connection(database_url)))
    }
}

struct MemoryConnection {
    shared: Arc<Mutex<Shared>>,
    url: String,
    transactional: bool,
    snapshot: Option<MemoryDatabase>,
}

fn backend(message: impl Into<String>) -> MigrateError {
    MigrateError::Backend {
        store: STORE_NAME,
        message: message.into(),
    }
}

impl MemoryConnection {
    fn with_db<R>(&self, f: impl FnOnce(&mut MemoryDatabase) -> R) -> R {
        let mut shared = self.shared.lock();
        f(shared.databases.entry(self.url.clone()).or_default())
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn begin(&mut self) -> Result<()> {
        if !self.transactional {
            return Err(backend("transactions are not supported"));
        }
        if self.snapshot.is_some() {
            return Err(backend("transaction already open"));
        }
        self.snapshot = Some(self.with_db(|db| db.clone()));
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.snapshot
            .take()
            .map(|_| ())
            .ok_or_else(|| backend("no transaction to commit"))
    }

    async fn rollback(&mut self) -> Result<()> {
        let snapshot = self
            .snapshot
            .take()
            .ok_or_else(|| backend("no transaction to roll back"))?;
        self.with_db(|db| *db = snapshot);
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        let mut shared = self.shared.lock();
        if let Some(fragment) = shared.failures.iter().find(|f| sql.contains(f.as_str())) {
            return Err(backend(format!("injected failure on '{fragment}'")));
        }
        shared
            .databases
            .entry(self.url.clone())
            .or_default()
            .executed
            .push(sql.to_string());
        Ok(())
    }

    async fn checkpoint(&mut self) -> Result<Checkpoint> {
        Ok(self.with_db(|db| db.checkpoint.clone().unwrap_or_default()))
    }

    async fn set_checkpoint(&mut self, checkpoint: &Checkpoint, _direction: Direction) -> Result<()> {
        self.with_db(|db| {
            db.legacy_marker = None;
            db.checkpoint = Some(checkpoint.clone());
            db.checkpoint_writes.push(checkpoint.clone());
        });
        Ok(())
    }

    async fn is_legacy_format(&mut self) -> Result<bool> {
        Ok(self.with_db(|db| db.legacy_marker.is_some()))
    }

    async fn legacy_checkpoint(&mut self) -> Result<Checkpoint> {
        Ok(self.with_db(|db| db.legacy_marker.clone().unwrap_or_default()))
    }

    async fn append_history(&mut self, entries: &[HistoryEntry]) -> Result<()> {
        self.with_db(|db| db.history.extend_from_slice(entries));
        Ok(())
    }

    async fn history(&mut self) -> Result<Vec<HistoryEntry>> {
        Ok(self.with_db(|db| db.history.clone()))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let Self {
            shared,
            url,
            snapshot,
            ..
        } = *self;
        if let Some(snapshot) = snapshot {
            shared.lock().databases.insert(url, snapshot);
        }
        Ok(())
    }
}
