//! Database query functions for the `queue_entries` table, including the
//! dispatcher's head-claim query.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::live_where;
use crate::models::{QueueEntry, QueueStatus};

/// Insert a new queue entry in `pending`.
pub async fn enqueue(
    pool: &PgPool,
    item_id: &str,
    payload: &serde_json::Value,
    priority: i32,
    is_reactivation: bool,
    enqueued_at: DateTime<Utc>,
) -> Result<QueueEntry> {
    let entry = sqlx::query_as::<_, QueueEntry>(
        "INSERT INTO queue_entries (item_id, payload, priority, is_reactivation, enqueued_at) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(item_id)
    .bind(payload)
    .bind(priority)
    .bind(is_reactivation)
    .bind(enqueued_at)
    .fetch_one(pool)
    .await
    .context("failed to enqueue entry")?;

    Ok(entry)
}

/// Fetch a single live queue entry by ID.
pub async fn get_entry(pool: &PgPool, id: Uuid) -> Result<Option<QueueEntry>> {
    let entry =
        sqlx::query_as::<_, QueueEntry>(live_where!("SELECT * FROM queue_entries WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch queue entry")?;

    Ok(entry)
}

/// List all live entries for an item, in enqueue order.
pub async fn list_entries_for_item(pool: &PgPool, item_id: &str) -> Result<Vec<QueueEntry>> {
    let entries = sqlx::query_as::<_, QueueEntry>(live_where!(
        "SELECT * FROM queue_entries WHERE item_id = $1",
        "ORDER BY enqueued_at ASC, created_at ASC"
    ))
    .bind(item_id)
    .fetch_all(pool)
    .await
    .context("failed to list entries for item")?;

    Ok(entries)
}

/// Claim the next dispatchable queue entry.
///
/// Selection rules (one statement, safe under concurrent dispatchers):
///
/// - per item, only the oldest `pending` entry is a candidate (FIFO);
/// - an item with any entry in `running` or `waiting_validation` is busy
///   and contributes no candidate (per-item serialization);
/// - across items, higher priority wins, then older enqueue time;
/// - `FOR UPDATE SKIP LOCKED` lets concurrent dispatchers pass over a head
///   another replica is claiming instead of blocking on it.
///
/// The claimed entry is moved `pending -> running` with `started_at` and the
/// wall-clock budget deadline stamped, and returned. `None` means nothing is
/// dispatchable right now.
pub async fn claim_next(
    pool: &PgPool,
    now: DateTime<Utc>,
    timeout_at: DateTime<Utc>,
) -> Result<Option<QueueEntry>> {
    let entry = sqlx::query_as::<_, QueueEntry>(
        "WITH heads AS ( \
             SELECT DISTINCT ON (item_id) id, item_id, priority, enqueued_at \
             FROM queue_entries \
             WHERE status = 'pending' AND deleted_at IS NULL \
             ORDER BY item_id, enqueued_at ASC, created_at ASC \
         ), \
         candidate AS ( \
             SELECT qe.id \
             FROM queue_entries qe \
             JOIN heads h ON h.id = qe.id \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM queue_entries busy \
                 WHERE busy.item_id = qe.item_id \
                   AND busy.status IN ('running', 'waiting_validation') \
                   AND busy.deleted_at IS NULL \
             ) \
             ORDER BY qe.priority DESC, qe.enqueued_at ASC \
             LIMIT 1 \
             FOR UPDATE OF qe SKIP LOCKED \
         ) \
         UPDATE queue_entries \
         SET status = 'running', \
             status_changed_by = 'dispatcher', \
             started_at = $1, \
             timeout_at = $2 \
         FROM candidate \
         WHERE queue_entries.id = candidate.id \
           AND queue_entries.status = 'pending' \
         RETURNING queue_entries.*",
    )
    .bind(now)
    .bind(timeout_at)
    .fetch_optional(pool)
    .await
    .context("failed to claim next queue entry")?;

    Ok(entry)
}

/// Atomically transition a queue entry from one status to another.
pub async fn transition_queue_status(
    pool: &PgPool,
    id: Uuid,
    from: QueueStatus,
    to: QueueStatus,
    changed_by: &str,
    reason: Option<&str>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(live_where!(
        "UPDATE queue_entries \
         SET status = $1, \
             status_changed_by = $2, \
             status_change_reason = $3, \
             completed_at = COALESCE($4, completed_at) \
         WHERE id = $5 AND status = $6"
    ))
    .bind(to)
    .bind(changed_by)
    .bind(reason)
    .bind(completed_at)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition queue entry status")?;

    Ok(result.rows_affected())
}

/// Record the broker's work-item ID on a claimed entry.
pub async fn set_dispatch_handle(pool: &PgPool, id: Uuid, handle: &str) -> Result<u64> {
    let result = sqlx::query(live_where!(
        "UPDATE queue_entries SET dispatch_handle = $1 WHERE id = $2"
    ))
    .bind(handle)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set queue entry dispatch handle")?;

    Ok(result.rows_affected())
}

/// The entry currently bound to a worker for an item (`running` or
/// `waiting_validation`), if any.
pub async fn bound_entry_for_item(pool: &PgPool, item_id: &str) -> Result<Option<QueueEntry>> {
    let entry = sqlx::query_as::<_, QueueEntry>(live_where!(
        "SELECT * FROM queue_entries \
         WHERE item_id = $1 \
           AND status IN ('running', 'waiting_validation')"
    ))
    .bind(item_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch bound entry for item")?;

    Ok(entry)
}

/// Cancel every `pending` entry for an item. Returns the cancelled entries.
pub async fn cancel_pending_for_item(
    pool: &PgPool,
    item_id: &str,
    reason: &str,
) -> Result<Vec<QueueEntry>> {
    let entries = sqlx::query_as::<_, QueueEntry>(live_where!(
        "UPDATE queue_entries \
         SET status = 'cancelled', \
             status_changed_by = 'cancel', \
             status_change_reason = $1, \
             completed_at = NOW() \
         WHERE item_id = $2 AND status = 'pending'",
        "RETURNING *"
    ))
    .bind(reason)
    .bind(item_id)
    .fetch_all(pool)
    .await
    .context("failed to cancel pending entries")?;

    Ok(entries)
}

/// Move every over-budget `running` entry to `timeout`. Returns the expired
/// entries so the caller can fail their runs.
pub async fn sweep_timeouts(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<QueueEntry>> {
    let entries = sqlx::query_as::<_, QueueEntry>(live_where!(
        "UPDATE queue_entries \
         SET status = 'timeout', \
             status_changed_by = 'sweeper', \
             status_change_reason = 'orchestrator_timeout', \
             completed_at = $1 \
         WHERE status = 'running' AND timeout_at IS NOT NULL AND timeout_at < $1",
        "RETURNING *"
    ))
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to sweep queue timeouts")?;

    Ok(entries)
}

/// Count of entries by non-terminal status, for health reporting.
pub async fn queue_depth(pool: &PgPool) -> Result<(i64, i64, i64)> {
    let row: (i64, i64, i64) = sqlx::query_as(live_where!(
        "SELECT COUNT(*) FILTER (WHERE status = 'pending'), \
                COUNT(*) FILTER (WHERE status = 'running'), \
                COUNT(*) FILTER (WHERE status = 'waiting_validation') \
         FROM queue_entries WHERE true"
    ))
    .fetch_one(pool)
    .await
    .context("failed to count queue depth")?;

    Ok(row)
}
