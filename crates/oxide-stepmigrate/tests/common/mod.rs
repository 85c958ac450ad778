#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use oxide_stepmigrate::prelude::*;

pub const DELIMITER: &str = "\n--//--\n";

/// Writes `<name>_up.sql` and `<name>_down.sql` into `dir`.
pub fn write_migration(dir: &Path, name: &str, up: &[&str], down: &[&str]) {
    fs::write(dir.join(format!("{name}_up.sql")), up.join(DELIMITER)).unwrap();
    fs::write(dir.join(format!("{name}_down.sql")), down.join(DELIMITER)).unwrap();
}

/// Migration whose step `i` creates table `<name>_<i>`; down scripts drop
/// them in reverse.
pub fn write_table_migration(dir: &Path, name: &str, steps: usize) {
    let tables: Vec<String> = (0..steps).map(|i| format!("{name}_{i}")).collect();
    let up: Vec<String> = tables
        .iter()
        .map(|t| format!("CREATE TABLE \"{t}\" (id INTEGER PRIMARY KEY);"))
        .collect();
    let down: Vec<String> = tables
        .iter()
        .rev()
        .map(|t| format!("DROP TABLE \"{t}\";"))
        .collect();
    let up: Vec<&str> = up.iter().map(String::as_str).collect();
    let down: Vec<&str> = down.iter().map(String::as_str).collect();
    write_migration(dir, name, &up, &down);
}

/// In-memory migration set whose scripts are `up <name> <i>` / `down <name> <i>`.
pub fn migration_set(migrations: &[(&str, usize)]) -> MigrationSet {
    MigrationSet::new(migrations.iter().map(|(name, steps)| {
        (0..*steps).fold(Migration::new(*name), |m, i| {
            m.step(format!("up {name} {i}"), format!("down {name} {i}"))
        })
    }))
    .unwrap()
}

pub fn memory_migrator(store: &MemoryStore, migrations: &[(&str, usize)]) -> Migrator {
    Migrator::with_migrations(Arc::new(store.clone()), "db", migration_set(migrations))
}

pub fn sqlite_url(dir: &Path) -> String {
    format!("sqlite://{}", dir.join("target.db").display())
}
