//! Script directories migrated against real SQLite files.

mod common;
use common::*;

use std::str::FromStr;

use oxide_stepmigrate::prelude::*;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tempfile::TempDir;

struct Fixture {
    scripts: TempDir,
    data: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            scripts: TempDir::new().unwrap(),
            data: TempDir::new().unwrap(),
        }
    }

    fn config(&self) -> MigrateConfig {
        MigrateConfig::new(sqlite_url(self.data.path())).migrations_dir(self.scripts.path())
    }

    fn migrator(&self) -> Migrator {
        Migrator::new(&self.config(), &StoreRegistry::builtin()).unwrap()
    }

    async fn pool(&self) -> SqlitePool {
        let options = SqliteConnectOptions::from_str(&sqlite_url(self.data.path()))
            .unwrap()
            .create_if_missing(true);
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap()
    }

    async fn tables(&self) -> Vec<String> {
        let pool = self.pool().await;
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE '\\_\\_%' ESCAPE '\\' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        pool.close().await;
        tables.into_iter().map(|(name,)| name).collect()
    }
}

#[tokio::test]
async fn test_apply_and_revert_everything() {
    let fixture = Fixture::new();
    write_table_migration(fixture.scripts.path(), "0001_users", 2);
    write_table_migration(fixture.scripts.path(), "0002_posts", 1);
    write_table_migration(fixture.scripts.path(), "0003_tags", 3);

    let migrator = fixture.migrator();
    assert_eq!(
        migrator.migration_names(),
        ["0001_users", "0002_posts", "0003_tags"]
    );

    let report = migrator.migrate_to("last").await.unwrap();
    assert_eq!(report.steps, 6);
    assert_eq!(
        migrator.current_state().await.unwrap(),
        ("0003_tags".to_string(), 0)
    );
    assert_eq!(fixture.tables().await.len(), 6);

    migrator.migrate_to("0001_users").await.unwrap();
    assert_eq!(fixture.tables().await, ["0001_users_0", "0001_users_1"]);

    migrator.migrate_to("initial").await.unwrap();
    assert!(fixture.tables().await.is_empty());
    assert_eq!(
        migrator.verify_history().await.unwrap(),
        Checkpoint::initial()
    );
    assert_eq!(migrator.history().await.unwrap().len(), 12);
}

#[tokio::test]
async fn test_broken_step_resumes_after_fix() {
    let fixture = Fixture::new();
    write_migration(
        fixture.scripts.path(),
        "0001_users",
        &[
            "CREATE TABLE users (id INTEGER PRIMARY KEY);",
            "CREATE TABLE profiles (id INTEGER PRIMARY KEY, user_id INTEGER);",
            "CREATE INDEX idx_profiles_user ON missing_table (user_id);",
        ],
        &[
            "DROP INDEX idx_profiles_user;",
            "DROP TABLE profiles;",
            "DROP TABLE users;",
        ],
    );

    let err = fixture.migrator().migrate_to("last").await.unwrap_err();
    assert!(matches!(err, MigrateError::Database(_)));
    assert_eq!(
        fixture.migrator().current_state().await.unwrap(),
        ("0001_users".to_string(), 1)
    );
    assert_eq!(fixture.tables().await, ["profiles", "users"]);

    write_migration(
        fixture.scripts.path(),
        "0001_users",
        &[
            "CREATE TABLE users (id INTEGER PRIMARY KEY);",
            "CREATE TABLE profiles (id INTEGER PRIMARY KEY, user_id INTEGER);",
            "CREATE INDEX idx_profiles_user ON profiles (user_id);",
        ],
        &[
            "DROP INDEX idx_profiles_user;",
            "DROP TABLE profiles;",
            "DROP TABLE users;",
        ],
    );

    let migrator = fixture.migrator();
    let report = migrator.migrate_to("last").await.unwrap();
    assert_eq!(report.steps, 1);
    assert_eq!(report.to, Checkpoint::at("0001_users", 0));
    assert_eq!(
        migrator.verify_history().await.unwrap(),
        Checkpoint::at("0001_users", 0)
    );
}

#[tokio::test]
async fn test_legacy_database_is_upgraded() {
    let fixture = Fixture::new();
    write_table_migration(fixture.scripts.path(), "A", 2);
    write_table_migration(fixture.scripts.path(), "B", 1);
    write_table_migration(fixture.scripts.path(), "C", 4);
    write_table_migration(fixture.scripts.path(), "D", 1);

    // Everything up to the second step of C was applied by an older release.
    let pool = fixture.pool().await;
    sqlx::raw_sql(
        "CREATE TABLE A_0 (id INTEGER PRIMARY KEY);
         CREATE TABLE A_1 (id INTEGER PRIMARY KEY);
         CREATE TABLE B_0 (id INTEGER PRIMARY KEY);
         CREATE TABLE C_0 (id INTEGER PRIMARY KEY);
         CREATE TABLE C_1 (id INTEGER PRIMARY KEY);
         CREATE VIEW \"__MigrationState\" AS SELECT 'C' AS \"state\", 2 AS \"substate\";",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;

    let migrator = fixture.migrator();
    assert_eq!(
        migrator.current_state().await.unwrap(),
        ("C".to_string(), 2)
    );
    assert_eq!(
        migrator.verify_history().await.unwrap(),
        Checkpoint::at("C", 2)
    );

    let report = migrator.migrate_to("last").await.unwrap();
    assert!(report.upgraded);
    assert_eq!(report.steps, 3);
    assert_eq!(fixture.tables().await.len(), 8);

    let history = migrator.history().await.unwrap();
    assert_eq!(history.len(), 8);
    assert!(history.iter().all(|e| e.direction == Direction::Up));
    assert_eq!(
        migrator.verify_history().await.unwrap(),
        Checkpoint::at("D", 0)
    );

    let report = migrator.migrate_to("last").await.unwrap();
    assert!(!report.upgraded);
    assert!(report.is_noop());
}

#[tokio::test]
async fn test_unknown_target_changes_nothing() {
    let fixture = Fixture::new();
    write_table_migration(fixture.scripts.path(), "0001_users", 1);

    let migrator = fixture.migrator();
    let err = migrator.migrate_to("0002_missing").await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Resolution);
    assert!(fixture.tables().await.is_empty());
}

#[tokio::test]
async fn test_reading_state_does_not_create_database() {
    let fixture = Fixture::new();
    write_table_migration(fixture.scripts.path(), "0001_users", 1);

    let migrator = fixture.migrator();
    let err = migrator.current_state().await.unwrap_err();
    assert!(matches!(err, MigrateError::Database(_)));
    assert!(migrator.history().await.is_err());
    assert!(!fixture.data.path().join("target.db").exists());

    migrator.migrate().await.unwrap();
    assert_eq!(
        migrator.current_state().await.unwrap(),
        ("0001_users".to_string(), 0)
    );
}

#[tokio::test]
async fn test_configured_target_drives_migrate() {
    let fixture = Fixture::new();
    write_table_migration(fixture.scripts.path(), "0001_users", 1);
    write_table_migration(fixture.scripts.path(), "0002_posts", 2);

    let config = fixture.config().target("0001_users");
    let migrator = Migrator::new(&config, &StoreRegistry::builtin()).unwrap();
    assert_eq!(migrator.configured_target(), "0001_users");
    assert_eq!(migrator.store_name(), "sqlite");

    let report = migrator.migrate().await.unwrap();
    assert_eq!(report.to, Checkpoint::at("0001_users", 0));
    assert_eq!(fixture.tables().await, ["0001_users_0"]);
}
