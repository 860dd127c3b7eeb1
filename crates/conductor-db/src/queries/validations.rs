//! Database query functions for the `validations` and `validation_responses`
//! tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::live_where;
use crate::models::{Validation, ValidationDecision, ValidationResponse, ValidationStatus};

/// Insert a new pending validation with a fresh external correlation UUID.
///
/// `rejection_count` is inherited from the parent validation when this is a
/// retry after modification, so the chain limit survives reactivation.
pub async fn insert_validation(
    pool: &PgPool,
    run_id: Uuid,
    step_id: Uuid,
    payload: &serde_json::Value,
    expires_at: DateTime<Utc>,
    rejection_count: i32,
    parent_validation_id: Option<Uuid>,
) -> Result<Validation> {
    let validation = sqlx::query_as::<_, Validation>(
        "INSERT INTO validations \
             (run_id, step_id, external_uuid, payload, expires_at, rejection_count, parent_validation_id) \
         VALUES ($1, $2, gen_random_uuid(), $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(run_id)
    .bind(step_id)
    .bind(payload)
    .bind(expires_at)
    .bind(rejection_count)
    .bind(parent_validation_id)
    .fetch_one(pool)
    .await
    .context("failed to insert validation")?;

    Ok(validation)
}

/// Fetch a live validation by its external correlation UUID.
///
/// The UUID is the only identity the response channel is trusted with.
pub async fn get_by_external_uuid(pool: &PgPool, external_uuid: Uuid) -> Result<Option<Validation>> {
    let validation = sqlx::query_as::<_, Validation>(live_where!(
        "SELECT * FROM validations WHERE external_uuid = $1"
    ))
    .bind(external_uuid)
    .fetch_optional(pool)
    .await
    .context("failed to fetch validation by external uuid")?;

    Ok(validation)
}

/// The single `pending` validation for a run, if any.
///
/// The validation-uniqueness invariant guarantees at most one exists while
/// the run is in `waiting_validation`.
pub async fn pending_validation_for_run(pool: &PgPool, run_id: Uuid) -> Result<Option<Validation>> {
    let validation = sqlx::query_as::<_, Validation>(live_where!(
        "SELECT * FROM validations \
         WHERE run_id = $1 AND status = 'pending'"
    ))
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch pending validation for run")?;

    Ok(validation)
}

/// List all live validations for a run, oldest first.
pub async fn list_validations_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<Validation>> {
    let validations = sqlx::query_as::<_, Validation>(live_where!(
        "SELECT * FROM validations WHERE run_id = $1",
        "ORDER BY created_at ASC"
    ))
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("failed to list validations for run")?;

    Ok(validations)
}

/// Atomically transition a validation from one status to another.
pub async fn transition_validation_status(
    pool: &PgPool,
    id: Uuid,
    from: ValidationStatus,
    to: ValidationStatus,
    changed_by: &str,
    reason: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(live_where!(
        "UPDATE validations \
         SET status = $1, \
             status_changed_by = $2, \
             status_change_reason = $3 \
         WHERE id = $4 AND status = $5"
    ))
    .bind(to)
    .bind(changed_by)
    .bind(reason)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition validation status")?;

    Ok(result.rows_affected())
}

/// Record one rejection against the chain. Returns the new count.
pub async fn increment_rejection_count(pool: &PgPool, id: Uuid) -> Result<i32> {
    let row: (i32,) = sqlx::query_as(live_where!(
        "UPDATE validations \
         SET rejection_count = rejection_count + 1 \
         WHERE id = $1",
        "RETURNING rejection_count"
    ))
    .bind(id)
    .fetch_one(pool)
    .await
    .context("failed to increment rejection count")?;

    Ok(row.0)
}

/// Persist the human response for a validation.
///
/// Idempotent on the validation: the UNIQUE constraint on `validation_id`
/// plus `ON CONFLICT DO NOTHING` makes the second call affect zero rows,
/// which the rendezvous surfaces as a conflict.
pub async fn insert_response(
    pool: &PgPool,
    validation_id: Uuid,
    decision: ValidationDecision,
    comments: Option<&str>,
    validator_id: &str,
    responded_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "INSERT INTO validation_responses \
             (validation_id, decision, comments, validator_id, responded_at) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (validation_id) DO NOTHING",
    )
    .bind(validation_id)
    .bind(decision)
    .bind(comments)
    .bind(validator_id)
    .bind(responded_at)
    .execute(pool)
    .await
    .context("failed to insert validation response")?;

    Ok(result.rows_affected())
}

/// Fetch the stored response for a validation, if any.
pub async fn get_response(pool: &PgPool, validation_id: Uuid) -> Result<Option<ValidationResponse>> {
    let response = sqlx::query_as::<_, ValidationResponse>(
        "SELECT * FROM validation_responses WHERE validation_id = $1",
    )
    .bind(validation_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch validation response")?;

    Ok(response)
}

/// Promote every `pending` validation past its deadline to `expired`.
/// Returns the expired validations so the caller can fail their runs.
pub async fn sweep_expired(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<Validation>> {
    let validations = sqlx::query_as::<_, Validation>(live_where!(
        "UPDATE validations \
         SET status = 'expired', \
             status_changed_by = 'sweeper', \
             status_change_reason = 'validation_expired' \
         WHERE status = 'pending' AND expires_at <= $1",
        "RETURNING *"
    ))
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to sweep expired validations")?;

    Ok(validations)
}
