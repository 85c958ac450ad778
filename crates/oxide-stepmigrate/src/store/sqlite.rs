//! SQLite state store.
//!
//! The legacy format keeps the checkpoint in a single view,
//! `__MigrationState(state, substate)`, recreated on every write. The history
//! format keeps it in a one-row table next to an append-only history table.
//! Writing a checkpoint in the history format drops the legacy view.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use tracing::debug;

use crate::checkpoint::{Checkpoint, Direction, HistoryEntry};
use crate::error::{MigrateError, Result};

use super::{StateStore, StoreConnection};

/// SQL creating the history-format tables.
pub const CREATE_STATE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS __migration_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    state TEXT NULL,
    substate INTEGER NOT NULL,
    direction TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS __migration_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    applied_at TEXT NOT NULL,
    state TEXT NOT NULL,
    substate INTEGER NOT NULL,
    direction TEXT NOT NULL CHECK (direction IN ('up', 'down'))
);
"#;

const LEGACY_VIEW: &str = "__MigrationState";
const STATE_TABLE: &str = "__migration_state";
const HISTORY_TABLE: &str = "__migration_history";

const SCHEMA_OBJECT_EXISTS_SQL: &str =
    "SELECT COUNT(*) FROM sqlite_master WHERE type = ? AND name = ?";
const LEGACY_GET_STATE_SQL: &str = r#"SELECT "state", "substate" FROM "__MigrationState""#;
const LEGACY_DROP_VIEW_SQL: &str = r#"DROP VIEW IF EXISTS "__MigrationState""#;

const GET_STATE_SQL: &str = "SELECT state, substate FROM __migration_state WHERE id = 1";
const SET_STATE_SQL: &str = r"
INSERT INTO __migration_state (id, state, substate, direction, updated_at)
VALUES (1, ?, ?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    state = excluded.state,
    substate = excluded.substate,
    direction = excluded.direction,
    updated_at = excluded.updated_at
";
const INSERT_HISTORY_SQL: &str =
    "INSERT INTO __migration_history (applied_at, state, substate, direction) VALUES (?, ?, ?, ?)";
const SELECT_HISTORY_SQL: &str =
    "SELECT applied_at, state, substate, direction FROM __migration_history ORDER BY id";

/// State store for SQLite databases, reached through sqlx.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteStore;

impl SqliteStore {
    /// Creates the store.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    async fn connect(&self, database_url: &str) -> Result<Box<dyn StoreConnection>> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = open_pool(options).await?;
        sqlx::Executor::execute(&pool, CREATE_STATE_TABLES_SQL).await?;
        debug!(url = %database_url, "Connected to SQLite database");

        Ok(Box::new(SqliteStoreConnection::new(pool)))
    }

    async fn connect_read_only(&self, database_url: &str) -> Result<Box<dyn StoreConnection>> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(false)
            .read_only(true);
        let pool = open_pool(options).await?;
        debug!(url = %database_url, "Connected to SQLite database read-only");

        Ok(Box::new(SqliteStoreConnection::new(pool)))
    }
}

async fn open_pool(options: SqliteConnectOptions) -> Result<SqlitePool> {
    Ok(SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?)
}

/// Connection handed out by [`SqliteStore`].
///
/// Outside a transaction a pooled connection is held; inside one, the
/// transaction owns it and rolls back if dropped without a commit.
struct SqliteStoreConnection {
    pool: SqlitePool,
    conn: Option<PoolConnection<Sqlite>>,
    tx: Option<Transaction<'static, Sqlite>>,
}

impl SqliteStoreConnection {
    fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            conn: None,
            tx: None,
        }
    }

    async fn connection(&mut self) -> Result<&mut SqliteConnection> {
        if let Some(tx) = self.tx.as_mut() {
            return Ok(&mut **tx);
        }
        if self.conn.is_none() {
            self.conn = Some(self.pool.acquire().await?);
        }
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut **conn),
            None => Err(sqlx::Error::PoolClosed.into()),
        }
    }

    async fn schema_object_exists(&mut self, kind: &str, name: &str) -> Result<bool> {
        let conn = self.connection().await?;
        let (count,): (i64,) = sqlx::query_as(SCHEMA_OBJECT_EXISTS_SQL)
            .bind(kind)
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;
        Ok(count != 0)
    }

    async fn legacy_view_exists(&mut self) -> Result<bool> {
        self.schema_object_exists("view", LEGACY_VIEW).await
    }
}

#[async_trait]
impl StoreConnection for SqliteStoreConnection {
    async fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(MigrateError::Backend {
                store: "sqlite",
                message: "transaction already open".to_string(),
            });
        }
        // The pool holds a single connection; release it for the transaction.
        self.conn = None;
        self.tx = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Err(MigrateError::Backend {
                store: "sqlite",
                message: "no transaction to commit".to_string(),
            }),
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Ok(()),
        }
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        let conn = self.connection().await?;
        sqlx::Executor::execute(&mut *conn, sql).await?;
        Ok(())
    }

    async fn checkpoint(&mut self) -> Result<Checkpoint> {
        // A database opened read-only may predate the state tables.
        if !self.schema_object_exists("table", STATE_TABLE).await? {
            return Ok(Checkpoint::initial());
        }
        let conn = self.connection().await?;
        let row: Option<(Option<String>, i64)> = sqlx::query_as(GET_STATE_SQL)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.map_or_else(Checkpoint::initial, |(state, substate)| {
            Checkpoint::new(state, substate)
        }))
    }

    async fn set_checkpoint(&mut self, checkpoint: &Checkpoint, direction: Direction) -> Result<()> {
        let conn = self.connection().await?;
        sqlx::query(LEGACY_DROP_VIEW_SQL).execute(&mut *conn).await?;
        sqlx::query(SET_STATE_SQL)
            .bind(checkpoint.state.as_deref())
            .bind(checkpoint.substate)
            .bind(direction.as_str())
            .bind(Utc::now())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn is_legacy_format(&mut self) -> Result<bool> {
        self.legacy_view_exists().await
    }

    async fn legacy_checkpoint(&mut self) -> Result<Checkpoint> {
        if !self.legacy_view_exists().await? {
            return Ok(Checkpoint::initial());
        }
        let conn = self.connection().await?;
        let row: Option<(Option<String>, i64)> = sqlx::query_as(LEGACY_GET_STATE_SQL)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.map_or_else(Checkpoint::initial, |(state, substate)| {
            Checkpoint::new(state, substate)
        }))
    }

    async fn append_history(&mut self, entries: &[HistoryEntry]) -> Result<()> {
        let conn = self.connection().await?;
        for entry in entries {
            sqlx::query(INSERT_HISTORY_SQL)
                .bind(entry.applied_at)
                .bind(&entry.state)
                .bind(entry.substate)
                .bind(entry.direction.as_str())
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    async fn history(&mut self) -> Result<Vec<HistoryEntry>> {
        if !self.schema_object_exists("table", HISTORY_TABLE).await? {
            return Ok(Vec::new());
        }
        let conn = self.connection().await?;
        let rows: Vec<(DateTime<Utc>, String, i64, String)> = sqlx::query_as(SELECT_HISTORY_SQL)
            .fetch_all(&mut *conn)
            .await?;

        rows.into_iter()
            .map(|(applied_at, state, substate, direction)| -> Result<HistoryEntry> {
                let direction = direction
                    .parse::<Direction>()
                    .map_err(MigrateError::CorruptHistory)?;
                Ok(HistoryEntry {
                    applied_at,
                    state,
                    substate,
                    direction,
                })
            })
            .collect()
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let Self { pool, conn, tx } = *self;
        drop(tx);
        drop(conn);
        pool.close().await;
        Ok(())
    }
}
