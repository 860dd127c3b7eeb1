//! Database query functions for the `run_steps` and `run_step_checkpoints`
//! tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::live_where;
use crate::models::{RunStep, StepCheckpoint, StepName, StepStatus};

/// Seed the step rows for a run as one contiguous 1..N batch.
///
/// All steps start `pending` with `retry_count = 0`. Returns the inserted
/// rows in step order.
pub async fn insert_steps(
    pool: &PgPool,
    run_id: Uuid,
    names: &[StepName],
    max_retries: i32,
) -> Result<Vec<RunStep>> {
    let mut tx = pool.begin().await.context("failed to begin step seed")?;

    let mut steps = Vec::with_capacity(names.len());
    for (idx, name) in names.iter().enumerate() {
        let step = sqlx::query_as::<_, RunStep>(
            "INSERT INTO run_steps (run_id, step_name, step_order, max_retries) \
             VALUES ($1, $2, $3, $4) \
             RETURNING *",
        )
        .bind(run_id)
        .bind(name)
        .bind((idx + 1) as i32)
        .bind(max_retries)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("failed to insert step {name} for run {run_id}"))?;
        steps.push(step);
    }

    tx.commit().await.context("failed to commit step seed")?;
    Ok(steps)
}

/// Fetch a single live step by ID.
pub async fn get_step(pool: &PgPool, id: Uuid) -> Result<Option<RunStep>> {
    let step = sqlx::query_as::<_, RunStep>(live_where!("SELECT * FROM run_steps WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch step")?;

    Ok(step)
}

/// List all live steps for a run, in step order.
pub async fn list_steps_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<RunStep>> {
    let steps = sqlx::query_as::<_, RunStep>(live_where!(
        "SELECT * FROM run_steps WHERE run_id = $1",
        "ORDER BY step_order ASC"
    ))
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("failed to list steps for run")?;

    Ok(steps)
}

/// The lowest-ordered step still in `pending`, if any.
///
/// The transition validator refuses to start it unless every prior step is
/// `completed` or `skipped`, so "lowest pending" is exactly "next to run".
pub async fn next_pending_step(pool: &PgPool, run_id: Uuid) -> Result<Option<RunStep>> {
    let step = sqlx::query_as::<_, RunStep>(live_where!(
        "SELECT * FROM run_steps \
         WHERE run_id = $1 AND status = 'pending'",
        "ORDER BY step_order ASC LIMIT 1"
    ))
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch next pending step")?;

    Ok(step)
}

/// The step currently in `running` for a run, if any (used by crash
/// recovery to find the mid-flight step).
pub async fn running_step(pool: &PgPool, run_id: Uuid) -> Result<Option<RunStep>> {
    let step = sqlx::query_as::<_, RunStep>(live_where!(
        "SELECT * FROM run_steps \
         WHERE run_id = $1 AND status = 'running'"
    ))
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch running step")?;

    Ok(step)
}

/// Count of steps for a run that incomplete prior steps would block.
///
/// Returns how many steps with order lower than `step_order` are not yet
/// `completed` or `skipped`. Zero means the step is clear to start.
pub async fn incomplete_predecessors(pool: &PgPool, run_id: Uuid, step_order: i32) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(live_where!(
        "SELECT COUNT(*) FROM run_steps \
         WHERE run_id = $1 \
           AND step_order < $2 \
           AND status NOT IN ('completed', 'skipped')"
    ))
    .bind(run_id)
    .bind(step_order)
    .fetch_one(pool)
    .await
    .context("failed to count incomplete predecessors")?;

    Ok(row.0)
}

/// Counts used for the run's progress percentage: (terminal-complete, total).
pub async fn step_progress_counts(pool: &PgPool, run_id: Uuid) -> Result<(i64, i64)> {
    let row: (i64, i64) = sqlx::query_as(live_where!(
        "SELECT COUNT(*) FILTER (WHERE status IN ('completed', 'skipped')), \
                COUNT(*) \
         FROM run_steps WHERE run_id = $1"
    ))
    .bind(run_id)
    .fetch_one(pool)
    .await
    .context("failed to count step progress")?;

    Ok(row)
}

/// Atomically transition a step from one status to another.
pub async fn transition_step_status(
    pool: &PgPool,
    id: Uuid,
    from: StepStatus,
    to: StepStatus,
    changed_by: &str,
    reason: Option<&str>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(live_where!(
        "UPDATE run_steps \
         SET status = $1, \
             status_changed_by = $2, \
             status_change_reason = $3, \
             started_at = COALESCE($4, started_at), \
             completed_at = COALESCE($5, completed_at) \
         WHERE id = $6 AND status = $7"
    ))
    .bind(to)
    .bind(changed_by)
    .bind(reason)
    .bind(started_at)
    .bind(completed_at)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition step status")?;

    Ok(result.rows_affected())
}

/// Requeue a running step for retry: `running -> pending`, incrementing the
/// retry counter. Optimistic on both status and the current counter value.
pub async fn requeue_step_for_retry(
    pool: &PgPool,
    id: Uuid,
    current_retry_count: i32,
    reason: &str,
) -> Result<u64> {
    let result = sqlx::query(live_where!(
        "UPDATE run_steps \
         SET status = 'pending', \
             retry_count = retry_count + 1, \
             status_changed_by = 'engine', \
             status_change_reason = $1, \
             started_at = NULL \
         WHERE id = $2 AND status = 'running' AND retry_count = $3"
    ))
    .bind(reason)
    .bind(id)
    .bind(current_retry_count)
    .execute(pool)
    .await
    .context("failed to requeue step for retry")?;

    Ok(result.rows_affected())
}

/// Record the input handed to a step when it starts.
pub async fn set_step_input(
    pool: &PgPool,
    id: Uuid,
    input: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(live_where!(
        "UPDATE run_steps SET input_data = $1 WHERE id = $2"
    ))
    .bind(input)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set step input")?;

    Ok(result.rows_affected())
}

/// Record a completed step's output, to be propagated to the next step.
pub async fn set_step_output(
    pool: &PgPool,
    id: Uuid,
    output: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(live_where!(
        "UPDATE run_steps SET output_data = $1 WHERE id = $2"
    ))
    .bind(output)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set step output")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Checkpoints
// -----------------------------------------------------------------------

/// Persist a fresh checkpoint for a step. Checkpoints are append-only; the
/// latest row wins on resume.
pub async fn insert_checkpoint(
    pool: &PgPool,
    step_id: Uuid,
    checkpoint_data: &serde_json::Value,
) -> Result<StepCheckpoint> {
    let cp = sqlx::query_as::<_, StepCheckpoint>(
        "INSERT INTO run_step_checkpoints (step_id, checkpoint_data) \
         VALUES ($1, $2) \
         RETURNING *",
    )
    .bind(step_id)
    .bind(checkpoint_data)
    .fetch_one(pool)
    .await
    .context("failed to insert checkpoint")?;

    Ok(cp)
}

/// The most recent checkpoint for a step, if any.
pub async fn latest_checkpoint(pool: &PgPool, step_id: Uuid) -> Result<Option<StepCheckpoint>> {
    let cp = sqlx::query_as::<_, StepCheckpoint>(
        "SELECT * FROM run_step_checkpoints \
         WHERE step_id = $1 \
         ORDER BY created_at DESC, id DESC \
         LIMIT 1",
    )
    .bind(step_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest checkpoint")?;

    Ok(cp)
}
