//! The ordered migration model and position arithmetic over it.

use std::collections::BTreeMap;

use crate::checkpoint::{Checkpoint, INITIAL_STATE, LAST_STATE};
use crate::error::{MigrateError, Result};

/// The smallest independently applied unit of a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStep {
    /// SQL applying the step.
    pub up: String,
    /// SQL reverting the step.
    pub down: String,
}

impl MigrationStep {
    /// Creates a step from its two scripts.
    #[must_use]
    pub fn new(up: impl Into<String>, down: impl Into<String>) -> Self {
        Self {
            up: up.into(),
            down: down.into(),
        }
    }
}

/// A named, ordered list of reversible steps.
///
/// Steps are paired by position: going up runs `up` of steps `0..K`, going
/// down runs `down` of steps `0..K`, so `down` of step `j` reverts `up` of
/// step `K - 1 - j`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Sortable migration name.
    pub name: String,
    /// Steps in execution order.
    pub steps: Vec<MigrationStep>,
}

impl Migration {
    /// Creates a migration without steps.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, up: impl Into<String>, down: impl Into<String>) -> Self {
        self.steps.push(MigrationStep::new(up, down));
        self
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

/// Checks that `substate` addresses a step of a migration with `step_count`
/// steps and returns it as an index.
pub fn check_substate_valid(state: &str, substate: i64, step_count: usize) -> Result<usize> {
    match usize::try_from(substate) {
        Ok(index) if index < step_count => Ok(index),
        _ => Err(MigrateError::SubstateNotApplicable {
            state: state.to_string(),
            substate,
            step_count,
        }),
    }
}

/// Sorted, read-only map of migration name to migration.
///
/// Positions are `Option<usize>`: `None` is the initial position and sorts
/// below every migration index.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    migrations: BTreeMap<String, Migration>,
    names: Vec<String>,
}

impl MigrationSet {
    /// Builds a set, rejecting migrations without steps.
    pub fn new(migrations: impl IntoIterator<Item = Migration>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for migration in migrations {
            if migration.steps.is_empty() {
                return Err(MigrateError::EmptyMigration(migration.name));
            }
            map.insert(migration.name.clone(), migration);
        }
        let names = map.keys().cloned().collect();
        Ok(Self {
            migrations: map,
            names,
        })
    }

    /// Returns the number of migrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns true if no migrations were loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Migration names in ascending order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Iterates migrations in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.values()
    }

    /// Looks a migration up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Migration> {
        self.migrations.get(name)
    }

    /// Returns the migration at a position index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn at(&self, index: usize) -> &Migration {
        &self.migrations[&self.names[index]]
    }

    /// Binary search for a name in the sorted name list.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names
            .binary_search_by(|candidate| candidate.as_str().cmp(name))
            .ok()
    }

    /// Name of the migration preceding `index`, `None` when `index` is the first.
    #[must_use]
    pub fn previous_state(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .map(|prev| self.names[prev].as_str())
    }

    /// Resolves a symbolic or exact target to a position.
    ///
    /// `last` maps to the newest migration (or the initial position when the
    /// set is empty), `initial` maps to `None`, anything else must be a
    /// loaded migration name.
    pub fn resolve_target(&self, target: &str) -> Result<Option<usize>> {
        if target.is_empty() {
            return Err(MigrateError::InvalidArgument {
                name: "target",
                message: "target state must not be empty".to_string(),
            });
        }
        match target {
            LAST_STATE => Ok(self.names.len().checked_sub(1)),
            INITIAL_STATE => Ok(None),
            name => self
                .index_of(name)
                .map(Some)
                .ok_or_else(|| MigrateError::UnknownState(name.to_string())),
        }
    }

    /// Resolves a stored checkpoint to a position.
    pub fn resolve_checkpoint(&self, checkpoint: &Checkpoint) -> Result<Option<usize>> {
        match checkpoint.state.as_deref() {
            None => Ok(None),
            Some(name) => self
                .index_of(name)
                .map(Some)
                .ok_or_else(|| MigrateError::UnknownDatabaseState(name.to_string())),
        }
    }

    /// Validates a checkpoint against the loaded set.
    pub fn validate_checkpoint(&self, checkpoint: &Checkpoint) -> Result<Option<usize>> {
        let position = self.resolve_checkpoint(checkpoint)?;
        if let Some(index) = position {
            let migration = self.at(index);
            check_substate_valid(&migration.name, checkpoint.substate, migration.step_count())?;
        }
        Ok(position)
    }

    /// Every step of every migration as `(state, substate)`, in the order a
    /// full upgrade from the initial position produces them.
    pub fn canonical_steps(&self) -> impl Iterator<Item = (&str, i64)> {
        self.iter().flat_map(|migration| {
            let count = i64::try_from(migration.step_count()).unwrap_or(i64::MAX);
            (0..count)
                .rev()
                .map(move |substate| (migration.name.as_str(), substate))
        })
    }
}
