//! Legacy checkpoint upgrade and history verification.
//!
//! Databases migrated before the history log existed only carry a single
//! `(state, substate)` marker. Upgrading synthesizes the history a fresh run
//! would have written up to that marker. Verification replays the log into
//! the stack of applied steps and checks it against the loaded migrations.

use tracing::info;

use crate::checkpoint::{Checkpoint, Direction, HistoryEntry};
use crate::error::{MigrateError, Result};
use crate::migration::MigrationSet;
use crate::store::{finish_transaction, StoreConnection};

/// History implied by `marker`: every step from the initial position up to
/// and including the step that produced it, oldest first.
pub fn synthesize_history(set: &MigrationSet, marker: &Checkpoint) -> Result<Vec<HistoryEntry>> {
    set.validate_checkpoint(marker)?;
    let Some(state) = marker.state.as_deref() else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::new();
    for (name, substate) in set.canonical_steps() {
        entries.push(HistoryEntry::now(name, substate, Direction::Up));
        if name == state && substate == marker.substate {
            break;
        }
    }
    Ok(entries)
}

/// Moves a legacy-format database to the history format.
///
/// Returns `true` if an upgrade happened. Once the store reports the history
/// format this is a no-op.
pub async fn upgrade_migration_info(
    conn: &mut dyn StoreConnection,
    transactional: bool,
    set: &MigrationSet,
) -> Result<bool> {
    if transactional {
        conn.begin().await?;
    }
    let outcome = upgrade(conn, set).await;
    finish_transaction(conn, transactional, outcome).await
}

async fn upgrade(conn: &mut dyn StoreConnection, set: &MigrationSet) -> Result<bool> {
    if !conn.is_legacy_format().await? {
        return Ok(false);
    }

    let marker = conn.legacy_checkpoint().await?;
    info!(state = %marker.human_state(), substate = marker.substate, "Upgrading legacy migration info");

    let entries = synthesize_history(set, &marker)?;
    conn.append_history(&entries).await?;
    conn.set_checkpoint(&marker, Direction::Up).await?;

    info!(entries = entries.len(), "Legacy migration info upgraded");
    Ok(true)
}

/// Replays a history log into the stack of currently applied steps.
///
/// An up entry must either continue the migration on top of the stack with
/// the next lower substate, or start a later migration once the top one is
/// complete. A down entry must name the top of the stack.
pub fn replay_history(set: &MigrationSet, history: &[HistoryEntry]) -> Result<Vec<HistoryEntry>> {
    let mut stack: Vec<HistoryEntry> = Vec::new();

    for (position, entry) in history.iter().enumerate() {
        let Some(index) = set.index_of(&entry.state) else {
            return Err(MigrateError::CorruptHistory(format!(
                "entry {position} names unknown state '{}'",
                entry.state
            )));
        };

        match entry.direction {
            Direction::Up => {
                if let Some(top) = stack.last() {
                    if top.state == entry.state {
                        if entry.substate + 1 != top.substate {
                            return Err(MigrateError::CorruptHistory(format!(
                                "entry {position} applies {}/{} after {}/{}",
                                entry.state, entry.substate, top.state, top.substate
                            )));
                        }
                    } else {
                        let top_index = set.index_of(&top.state);
                        if top_index >= Some(index) {
                            return Err(MigrateError::CorruptHistory(format!(
                                "entry {position} applies '{}' after later state '{}'",
                                entry.state, top.state
                            )));
                        }
                        if top.substate != 0 {
                            return Err(MigrateError::CorruptHistory(format!(
                                "entry {position} starts '{}' while '{}' is incomplete",
                                entry.state, top.state
                            )));
                        }
                    }
                }
                stack.push(entry.clone());
            }
            Direction::Down => {
                let Some(top) = stack.last() else {
                    return Err(MigrateError::CorruptHistory(format!(
                        "entry {position} reverts {}/{} with nothing applied",
                        entry.state, entry.substate
                    )));
                };
                if !top.same_step(entry) {
                    return Err(MigrateError::CorruptHistory(format!(
                        "entry {position} reverts {}/{} but {}/{} is on top",
                        entry.state, entry.substate, top.state, top.substate
                    )));
                }
                stack.pop();
            }
        }
    }

    Ok(stack)
}

/// Checks that a replayed stack is a prefix of the canonical step order.
pub fn check_applied_steps(set: &MigrationSet, applied: &[HistoryEntry]) -> Result<()> {
    let mut canonical = set.canonical_steps();
    for (position, entry) in applied.iter().enumerate() {
        match canonical.next() {
            Some((state, substate)) if state == entry.state && substate == entry.substate => {}
            Some((state, substate)) => {
                return Err(MigrateError::CorruptHistory(format!(
                    "applied step {position} is {}/{}, expected {state}/{substate}",
                    entry.state, entry.substate
                )));
            }
            None => {
                return Err(MigrateError::CorruptHistory(format!(
                    "applied step {position} ({}/{}) is beyond the last migration",
                    entry.state, entry.substate
                )));
            }
        }
    }
    Ok(())
}

/// Checkpoint implied by a replayed stack.
#[must_use]
pub fn checkpoint_of(applied: &[HistoryEntry]) -> Checkpoint {
    applied.last().map_or_else(Checkpoint::initial, |top| {
        Checkpoint::at(top.state.clone(), top.substate)
    })
}

/// Replays `history` and checks it against `set`, returning the implied checkpoint.
pub fn check_history(set: &MigrationSet, history: &[HistoryEntry]) -> Result<Checkpoint> {
    let applied = replay_history(set, history)?;
    check_applied_steps(set, &applied)?;
    Ok(checkpoint_of(&applied))
}
