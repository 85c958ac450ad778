//! Loading migration scripts from a directory.
//!
//! Scripts are named `<name>_up.<ext>` and `<name>_down.<ext>`; the direction
//! tag is case-insensitive and files that do not match are ignored. Each
//! script body is split into steps on a delimiter line (`--//--` by default).

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::checkpoint::Direction;
use crate::error::{MigrateError, Result};
use crate::migration::{Migration, MigrationSet};

/// Line separating two steps inside a script.
pub const DEFAULT_STEP_DELIMITER: &str = "--//--";

static SCRIPT_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>.+)_(?P<direction>(?i:up|down))\.(?P<ext>[^.]+)$")
        .expect("Invalid script filename regex")
});

#[derive(Debug)]
struct LoadedScript {
    path: PathBuf,
    ext: String,
    steps: Vec<String>,
}

/// Reads a migrations directory into a [`MigrationSet`].
#[derive(Debug, Clone)]
pub struct ScriptLoader {
    dir: PathBuf,
    delimiter: String,
}

impl ScriptLoader {
    /// Creates a loader for the given directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            delimiter: DEFAULT_STEP_DELIMITER.to_string(),
        }
    }

    /// Overrides the step delimiter line.
    #[must_use]
    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    /// Returns the directory being loaded.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads and pairs every script in the directory.
    pub fn load(&self) -> Result<MigrationSet> {
        if !self.dir.is_dir() {
            return Err(MigrateError::MigrationsDirNotFound(self.dir.clone()));
        }

        let unreadable = |source| MigrateError::DirectoryUnreadable {
            path: self.dir.clone(),
            source,
        };

        let mut up: BTreeMap<String, LoadedScript> = BTreeMap::new();
        let mut down: BTreeMap<String, LoadedScript> = BTreeMap::new();

        for entry in fs::read_dir(&self.dir).map_err(unreadable)? {
            let entry = entry.map_err(unreadable)?;
            if !entry.file_type().map_err(unreadable)?.is_file() {
                continue;
            }

            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                debug!(file = ?entry.path(), "Skipping non UTF-8 file name");
                continue;
            };
            let Some(captures) = SCRIPT_FILENAME.captures(file_name) else {
                debug!(file = %file_name, "Skipping file not named like a migration script");
                continue;
            };

            let name = captures["name"].to_string();
            let direction: Direction = captures["direction"]
                .parse()
                .map_err(|message| MigrateError::InvalidArgument {
                    name: "direction",
                    message,
                })?;

            let path = entry.path();
            debug!(script = %file_name, "Loading script");
            let body = fs::read_to_string(&path).map_err(|source| MigrateError::ScriptUnreadable {
                path: path.clone(),
                source,
            })?;

            let script = LoadedScript {
                ext: captures["ext"].to_string(),
                steps: split_steps(&body, &self.delimiter),
                path: path.clone(),
            };

            let scripts = match direction {
                Direction::Up => &mut up,
                Direction::Down => &mut down,
            };
            if scripts.insert(name, script).is_some() {
                return Err(MigrateError::DuplicateScript(path));
            }
        }

        let names: BTreeSet<String> = up.keys().chain(down.keys()).cloned().collect();
        let mut migrations = Vec::with_capacity(names.len());

        for name in names {
            let (up_script, down_script) = match (up.remove(&name), down.remove(&name)) {
                (Some(u), Some(d)) => (u, d),
                (Some(present), None) => {
                    return Err(missing_script(name, Direction::Down, &present));
                }
                (None, Some(present)) => {
                    return Err(missing_script(name, Direction::Up, &present));
                }
                (None, None) => continue,
            };

            if up_script.steps.len() != down_script.steps.len() {
                return Err(MigrateError::StepCountMismatch {
                    migration: name,
                    up: up_script.steps.len(),
                    down: down_script.steps.len(),
                });
            }

            debug!(
                migration = %name,
                steps = up_script.steps.len(),
                up = %up_script.path.display(),
                down = %down_script.path.display(),
                "Loaded migration"
            );

            let migration = up_script
                .steps
                .into_iter()
                .zip(down_script.steps)
                .fold(Migration::new(name), |m, (u, d)| m.step(u, d));
            migrations.push(migration);
        }

        MigrationSet::new(migrations)
    }
}

fn missing_script(migration: String, absent: Direction, present: &LoadedScript) -> MigrateError {
    let script = format!("{}_{}.{}", migration, absent, present.ext);
    MigrateError::MissingScript { migration, script }
}

/// Loads a directory with the default step delimiter.
pub fn load_migrations(dir: impl Into<PathBuf>) -> Result<MigrationSet> {
    ScriptLoader::new(dir).load()
}

/// Splits a script body into steps on lines equal to `delimiter`.
///
/// A blank script has no steps. The delimiter line itself is not part of
/// either neighbouring step.
#[must_use]
pub fn split_steps(script: &str, delimiter: &str) -> Vec<String> {
    if script.trim().is_empty() {
        return Vec::new();
    }

    let mut steps = Vec::new();
    let mut current = String::new();
    for line in script.split_inclusive('\n') {
        if line.trim() == delimiter {
            steps.push(std::mem::take(&mut current));
        } else {
            current.push_str(line);
        }
    }
    steps.push(current);
    steps
}
