//! Step executor.
//!
//! This module runs a single planned step against a store connection: it
//! re-checks the checkpoint, runs the step's SQL, records the new checkpoint
//! and the history entry, all inside one transaction when the store has them.

use tracing::debug;

use crate::error::{MigrateError, Result};
use crate::store::{finish_transaction, StoreConnection};
use crate::traversal::PlannedStep;

/// Executes one step, committing or rolling back as a unit when `transactional`.
///
/// Errors are returned unchanged. After a failure the checkpoint stays at the
/// last committed step.
pub async fn execute_step(
    conn: &mut dyn StoreConnection,
    transactional: bool,
    step: &PlannedStep<'_>,
) -> Result<()> {
    debug!(
        migration = %step.migration,
        step = step.index,
        direction = %step.direction,
        to = %step.to,
        "Moving database state"
    );

    if transactional {
        conn.begin().await?;
    }
    let outcome = run_step(conn, step).await;
    finish_transaction(conn, transactional, outcome).await
}

async fn run_step(conn: &mut dyn StoreConnection, step: &PlannedStep<'_>) -> Result<()> {
    let actual = conn.checkpoint().await?;
    if actual != step.from {
        return Err(MigrateError::StateDrift {
            expected: step.from.clone(),
            actual,
        });
    }

    if step.sql.trim().is_empty() {
        debug!(migration = %step.migration, step = step.index, "Step has no SQL, skipping execution");
    } else {
        conn.execute(step.sql).await?;
    }

    conn.set_checkpoint(&step.to, step.direction).await?;
    conn.append_history(&[step.history_entry()]).await?;
    Ok(())
}
