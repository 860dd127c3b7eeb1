//! Database query functions for the `runs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::live_where;
use crate::models::{Run, RunStatus, StepName};

/// Insert a new run for a ticket.
///
/// The run number is allocated as `max(run_number) + 1` in the same
/// statement; the per-ticket UNIQUE constraint on `(ticket_id, run_number)`
/// turns a rare allocation race into a constraint error rather than a
/// duplicate. Callers hold the ticket's advisory lock, so in practice the
/// subselect is uncontended.
pub async fn insert_run(
    pool: &PgPool,
    ticket_id: Uuid,
    is_reactivation: bool,
    parent_run_id: Option<Uuid>,
    reactivation_depth: i32,
) -> Result<Run> {
    let run = sqlx::query_as::<_, Run>(
        "INSERT INTO runs (ticket_id, run_number, is_reactivation, parent_run_id, reactivation_depth) \
         SELECT $1, \
                COALESCE(MAX(run_number), 0) + 1, \
                $2, $3, $4 \
         FROM runs WHERE ticket_id = $1 \
         RETURNING *",
    )
    .bind(ticket_id)
    .bind(is_reactivation)
    .bind(parent_run_id)
    .bind(reactivation_depth)
    .fetch_one(pool)
    .await
    .context("failed to insert run")?;

    Ok(run)
}

/// Fetch a single live run by ID.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<Option<Run>> {
    let run = sqlx::query_as::<_, Run>(live_where!("SELECT * FROM runs WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch run")?;

    Ok(run)
}

/// List all live runs for a ticket, in run-number order.
pub async fn list_runs_for_ticket(pool: &PgPool, ticket_id: Uuid) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(live_where!(
        "SELECT * FROM runs WHERE ticket_id = $1",
        "ORDER BY run_number ASC"
    ))
    .bind(ticket_id)
    .fetch_all(pool)
    .await
    .context("failed to list runs for ticket")?;

    Ok(runs)
}

/// Return the single non-terminal run for a ticket, if any.
///
/// The single-active invariant guarantees at most one exists.
pub async fn active_run_for_ticket(pool: &PgPool, ticket_id: Uuid) -> Result<Option<Run>> {
    let run = sqlx::query_as::<_, Run>(live_where!(
        "SELECT * FROM runs \
         WHERE ticket_id = $1 \
           AND status NOT IN ('completed', 'failed', 'cancelled')"
    ))
    .bind(ticket_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch active run for ticket")?;

    Ok(run)
}

/// Atomically transition a run from one status to another.
///
/// Compare-and-update on the expected `from` status. `failure_reason` is
/// recorded only when provided (terminal failure paths); `started_at` /
/// `completed_at` are set on first entry into running / a terminal state
/// and `duration_ms` is computed by trigger. History is written by trigger.
pub async fn transition_run_status(
    pool: &PgPool,
    id: Uuid,
    from: RunStatus,
    to: RunStatus,
    changed_by: &str,
    failure_reason: Option<&str>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(live_where!(
        "UPDATE runs \
         SET status = $1, \
             status_changed_by = $2, \
             status_change_reason = $3, \
             failure_reason = COALESCE($3, failure_reason), \
             started_at = COALESCE($4, started_at), \
             completed_at = COALESCE($5, completed_at) \
         WHERE id = $6 AND status = $7"
    ))
    .bind(to)
    .bind(changed_by)
    .bind(failure_reason)
    .bind(started_at)
    .bind(completed_at)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition run status")?;

    Ok(result.rows_affected())
}

/// Record the broker's work-item ID on a run.
pub async fn set_dispatch_handle(pool: &PgPool, id: Uuid, handle: &str) -> Result<u64> {
    let result = sqlx::query(live_where!(
        "UPDATE runs SET dispatch_handle = $1 WHERE id = $2"
    ))
    .bind(handle)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set run dispatch handle")?;

    Ok(result.rows_affected())
}

/// Record which step the run is currently on.
pub async fn set_current_step(pool: &PgPool, id: Uuid, step: StepName) -> Result<u64> {
    let result = sqlx::query(live_where!(
        "UPDATE runs SET current_step = $1 WHERE id = $2"
    ))
    .bind(step)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set current step")?;

    Ok(result.rows_affected())
}

/// Write the run's progress percentage.
///
/// `GREATEST` keeps the value monotonically non-decreasing even under a
/// racing stale writer.
pub async fn set_progress(pool: &PgPool, id: Uuid, percentage: i32) -> Result<u64> {
    let result = sqlx::query(live_where!(
        "UPDATE runs \
         SET progress_percentage = GREATEST(progress_percentage, $1) \
         WHERE id = $2"
    ))
    .bind(percentage)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set run progress")?;

    Ok(result.rows_affected())
}

/// Flag a run for cancellation. The bound worker observes the flag between
/// steps; the cancel watchdog enforces the grace window.
pub async fn request_cancel(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(live_where!(
        "UPDATE runs SET cancel_requested = TRUE \
         WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')"
    ))
    .bind(id)
    .execute(pool)
    .await
    .context("failed to request run cancellation")?;

    Ok(result.rows_affected())
}

/// Runs whose cancellation was requested but which are still non-terminal.
pub async fn list_cancel_requested(pool: &PgPool) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(live_where!(
        "SELECT * FROM runs \
         WHERE cancel_requested = TRUE \
           AND status NOT IN ('completed', 'failed', 'cancelled')"
    ))
    .fetch_all(pool)
    .await
    .context("failed to list cancel-requested runs")?;

    Ok(runs)
}

/// Runs abandoned by a crashed worker: status `running`, owning queue entry
/// still `running`, but carrying a dispatch handle no live worker owns.
///
/// The caller (startup recovery) decides per run between checkpoint resume
/// and `failed(orphan_on_restart)`; the broker answers which handles are
/// live.
pub async fn list_possibly_orphaned_runs(pool: &PgPool) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT r.* FROM runs r \
         JOIN queue_entries qe ON qe.dispatch_handle = r.dispatch_handle \
         WHERE r.status = 'running' \
           AND qe.status = 'running' \
           AND r.dispatch_handle IS NOT NULL \
           AND r.deleted_at IS NULL \
           AND qe.deleted_at IS NULL",
    )
    .fetch_all(pool)
    .await
    .context("failed to list possibly orphaned runs")?;

    Ok(runs)
}

/// Walk the parent chain from a run, oldest ancestor last.
///
/// Depth-bounded: stops after `max_depth` hops even if the chain (illegally)
/// cycles.
pub async fn parent_chain(pool: &PgPool, run_id: Uuid, max_depth: i32) -> Result<Vec<Run>> {
    let mut chain = Vec::new();
    let mut cursor = Some(run_id);
    let mut hops = 0;

    while let Some(id) = cursor {
        if hops > max_depth {
            anyhow::bail!(
                "parent chain from run {} exceeds depth bound {}",
                run_id,
                max_depth
            );
        }
        let Some(run) = get_run(pool, id).await? else {
            break;
        };
        cursor = run.parent_run_id;
        chain.push(run);
        hops += 1;
    }

    Ok(chain)
}
