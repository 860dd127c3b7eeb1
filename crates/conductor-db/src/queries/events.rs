//! Inbound-event bookkeeping: the at-most-once dedup guard and the
//! partitioned webhook event log.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Record an external event ID in the dedup table.
///
/// Returns `true` if this is the first sighting within the dedup window
/// (the caller should process the event), `false` on a duplicate.
pub async fn try_record_event(
    pool: &PgPool,
    event_id: &str,
    seen_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO event_dedup (event_id, seen_at) \
         VALUES ($1, $2) \
         ON CONFLICT (event_id) DO NOTHING",
    )
    .bind(event_id)
    .bind(seen_at)
    .execute(pool)
    .await
    .context("failed to record event for dedup")?;

    Ok(result.rows_affected() == 1)
}

/// Prune dedup rows older than the window cutoff. Returns how many were
/// removed.
pub async fn prune_dedup(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM event_dedup WHERE seen_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await
        .context("failed to prune event dedup table")?;

    Ok(result.rows_affected())
}

/// Append an inbound event to the monthly-partitioned event log.
///
/// `outcome` records what the intake did with it (`enqueued`,
/// `deduplicated`, `validation_response`, `rejected_malformed`, ...).
pub async fn log_webhook_event(
    pool: &PgPool,
    event_id: &str,
    source: &str,
    event_type: &str,
    payload: &serde_json::Value,
    outcome: &str,
    received_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO logs.webhook_events \
             (event_id, source, event_type, payload, outcome, received_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(event_id)
    .bind(source)
    .bind(event_type)
    .bind(payload)
    .bind(outcome)
    .bind(received_at)
    .execute(pool)
    .await
    .context("failed to log webhook event")?;

    Ok(())
}

/// Count of logged events for an event ID (diagnostics; the dedup table,
/// not this log, is the at-most-once authority).
pub async fn count_logged_events(pool: &PgPool, event_id: &str) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM logs.webhook_events WHERE event_id = $1")
            .bind(event_id)
            .fetch_one(pool)
            .await
            .context("failed to count logged events")?;

    Ok(row.0)
}
