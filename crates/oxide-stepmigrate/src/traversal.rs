//! Computing the ordered steps between two checkpoints.
//!
//! Going up, step `j` of a migration with `K` steps leaves the checkpoint at
//! `(name, K - 1 - j)`, so substates count down to 0 as the migration
//! completes. Going down, step `j` leaves `(name, j + 1)`, and the last step
//! moves the checkpoint to the previous migration at substate 0.

use crate::checkpoint::{Checkpoint, Direction, HistoryEntry};
use crate::error::Result;
use crate::migration::{check_substate_valid, Migration, MigrationSet};

/// One step scheduled for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep<'a> {
    /// Migration the step belongs to.
    pub migration: &'a str,
    /// Index of the step within the migration.
    pub index: usize,
    /// Whether the up or down script runs.
    pub direction: Direction,
    /// Script to run.
    pub sql: &'a str,
    /// Checkpoint the database must be at before the step.
    pub from: Checkpoint,
    /// Checkpoint written once the step succeeds.
    pub to: Checkpoint,
}

impl PlannedStep<'_> {
    /// History entry recorded for this step.
    ///
    /// Up steps are named by the checkpoint they produce, down steps by the
    /// checkpoint they revert.
    #[must_use]
    pub fn history_entry(&self) -> HistoryEntry {
        let substate = match self.direction {
            Direction::Up => self.to.substate,
            Direction::Down => self.from.substate,
        };
        HistoryEntry::now(self.migration, substate, self.direction)
    }
}

fn substate(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Plans the steps moving the database from `current` to `target`.
///
/// An empty plan means the database is already fully at `target`.
pub fn plan<'a>(
    set: &'a MigrationSet,
    current: &Checkpoint,
    target: Option<usize>,
) -> Result<Vec<PlannedStep<'a>>> {
    let position = set.resolve_checkpoint(current)?;
    let resume = match position {
        Some(index) => {
            let migration = set.at(index);
            check_substate_valid(&migration.name, current.substate, migration.step_count())?
        }
        None => 0,
    };

    let mut planner = Planner {
        set,
        from: Checkpoint::new(current.state.clone(), current.substate),
        steps: Vec::new(),
    };

    if target >= position {
        planner.up(position, resume, target);
    } else if let Some(index) = position {
        planner.down(index, resume, target);
    }

    Ok(planner.steps)
}

struct Planner<'a> {
    set: &'a MigrationSet,
    from: Checkpoint,
    steps: Vec<PlannedStep<'a>>,
}

impl<'a> Planner<'a> {
    fn push(&mut self, migration: &'a Migration, index: usize, direction: Direction, to: Checkpoint) {
        let step = &migration.steps[index];
        let sql = match direction {
            Direction::Up => step.up.as_str(),
            Direction::Down => step.down.as_str(),
        };
        let from = std::mem::replace(&mut self.from, to.clone());
        self.steps.push(PlannedStep {
            migration: &migration.name,
            index,
            direction,
            sql,
            from,
            to,
        });
    }

    fn up(&mut self, position: Option<usize>, resume: usize, target: Option<usize>) {
        let Some(target) = target else {
            return;
        };
        let set = self.set;

        // Finish a migration interrupted partway.
        if let Some(current) = position {
            let migration = set.at(current);
            let count = migration.step_count();
            for j in count - resume..count {
                self.push(
                    migration,
                    j,
                    Direction::Up,
                    Checkpoint::at(&migration.name, substate(count - 1 - j)),
                );
            }
        }

        let first = position.map_or(0, |current| current + 1);
        for i in first..=target {
            let migration = set.at(i);
            let count = migration.step_count();
            for j in 0..count {
                self.push(
                    migration,
                    j,
                    Direction::Up,
                    Checkpoint::at(&migration.name, substate(count - 1 - j)),
                );
            }
        }
    }

    fn down(&mut self, current: usize, resume: usize, target: Option<usize>) {
        self.revert(current, resume);

        let last = target.map_or(0, |target| target + 1);
        for i in (last..current).rev() {
            self.revert(i, 0);
        }
    }

    fn revert(&mut self, index: usize, resume: usize) {
        let set = self.set;
        let migration = set.at(index);
        let count = migration.step_count();
        for j in resume..count {
            let to = if j + 1 < count {
                Checkpoint::at(&migration.name, substate(j + 1))
            } else {
                Checkpoint::new(set.previous_state(index).map(str::to_string), 0)
            };
            self.push(migration, j, Direction::Down, to);
        }
    }
}
