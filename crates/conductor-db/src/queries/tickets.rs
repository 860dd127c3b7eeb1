//! Database query functions for the `tickets` table: CRUD, the advisory
//! per-ticket lock, and cooldown bookkeeping.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::live_where;
use crate::models::{Ticket, TicketStatus};

/// Insert a new ticket row in `pending`. Returns the inserted ticket with
/// server-generated defaults.
pub async fn insert_ticket(
    pool: &PgPool,
    external_id: &str,
    title: &str,
    description: &str,
    repository_url: &str,
) -> Result<Ticket> {
    let ticket = sqlx::query_as::<_, Ticket>(
        "INSERT INTO tickets (external_id, title, description, repository_url) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(external_id)
    .bind(title)
    .bind(description)
    .bind(repository_url)
    .fetch_one(pool)
    .await
    .context("failed to insert ticket")?;

    Ok(ticket)
}

/// Fetch a single live ticket by ID.
pub async fn get_ticket(pool: &PgPool, id: Uuid) -> Result<Option<Ticket>> {
    let ticket = sqlx::query_as::<_, Ticket>(live_where!("SELECT * FROM tickets WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch ticket")?;

    Ok(ticket)
}

/// Fetch a single live ticket by its external tracker ID.
pub async fn get_ticket_by_external_id(pool: &PgPool, external_id: &str) -> Result<Option<Ticket>> {
    let ticket = sqlx::query_as::<_, Ticket>(live_where!(
        "SELECT * FROM tickets WHERE external_id = $1"
    ))
    .bind(external_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch ticket by external id")?;

    Ok(ticket)
}

/// List all live tickets, newest first.
pub async fn list_tickets(pool: &PgPool) -> Result<Vec<Ticket>> {
    let tickets = sqlx::query_as::<_, Ticket>(live_where!(
        "SELECT * FROM tickets WHERE true",
        "ORDER BY created_at DESC"
    ))
    .fetch_all(pool)
    .await
    .context("failed to list tickets")?;

    Ok(tickets)
}

/// Atomically transition a ticket from one status to another.
///
/// Compare-and-update: the WHERE clause pins the expected `from` status, so
/// zero rows affected means the caller lost the race (or the row is gone /
/// soft-deleted -- classify with [`crate::soft_delete::row_state`]).
/// `previous_status` is snapshotted from the old status in the same write;
/// the history row is appended by trigger.
pub async fn transition_ticket_status(
    pool: &PgPool,
    id: Uuid,
    from: TicketStatus,
    to: TicketStatus,
    changed_by: &str,
    reason: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(live_where!(
        "UPDATE tickets \
         SET status = $1, \
             previous_status = status, \
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
    .context("failed to transition ticket status")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Advisory lock
// -----------------------------------------------------------------------

/// Try to acquire the advisory lock on a ticket.
///
/// One atomic UPDATE: succeeds when the ticket is unlocked, or when the
/// existing lock has passed its TTL (`locked_at < stale_before`). Returns
/// the number of rows affected (1 = acquired, 0 = refused).
pub async fn try_acquire_lock(
    pool: &PgPool,
    id: Uuid,
    holder: &str,
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(live_where!(
        "UPDATE tickets \
         SET is_locked = TRUE, \
             locked_by = $1, \
             locked_at = $2, \
             lock_change_reason = 'acquired' \
         WHERE id = $3 \
           AND (is_locked = FALSE OR locked_at < $4)"
    ))
    .bind(holder)
    .bind(now)
    .bind(id)
    .bind(stale_before)
    .execute(pool)
    .await
    .context("failed to acquire ticket lock")?;

    Ok(result.rows_affected())
}

/// Release the advisory lock, but only if `holder` still owns it.
pub async fn release_lock(pool: &PgPool, id: Uuid, holder: &str) -> Result<u64> {
    let result = sqlx::query(live_where!(
        "UPDATE tickets \
         SET is_locked = FALSE, \
             locked_by = NULL, \
             locked_at = NULL, \
             lock_change_reason = 'released' \
         WHERE id = $1 AND is_locked = TRUE AND locked_by = $2"
    ))
    .bind(id)
    .bind(holder)
    .execute(pool)
    .await
    .context("failed to release ticket lock")?;

    Ok(result.rows_affected())
}

/// Force-release every lock older than `stale_before`.
///
/// This is the sweeper's path -- the only legal unlock other than an
/// explicit holder release. Returns the tickets whose locks were broken so
/// the caller can log a warning per ticket; the `force_release` lock-history
/// row is written by trigger.
pub async fn force_release_stale_locks(
    pool: &PgPool,
    stale_before: DateTime<Utc>,
) -> Result<Vec<Ticket>> {
    let tickets = sqlx::query_as::<_, Ticket>(live_where!(
        "UPDATE tickets \
         SET is_locked = FALSE, \
             locked_by = NULL, \
             locked_at = NULL, \
             lock_change_reason = 'force_release' \
         WHERE is_locked = TRUE AND locked_at < $1",
        "RETURNING *"
    ))
    .bind(stale_before)
    .fetch_all(pool)
    .await
    .context("failed to force-release stale locks")?;

    Ok(tickets)
}

// -----------------------------------------------------------------------
// Cooldown
// -----------------------------------------------------------------------

/// Record a failed reactivation attempt and set the cooldown embargo.
///
/// One statement: the attempt counter is incremented and the embargo set to
/// `now + min(base * 2^(n-1), cap)` where `n` is the post-increment count,
/// so the backoff and the counter can never disagree. Returns the new count
/// and the computed `cooldown_until`. The counter is reset to zero by
/// trigger when any run for the ticket completes successfully.
pub async fn enter_cooldown(
    pool: &PgPool,
    id: Uuid,
    now: DateTime<Utc>,
    base_secs: f64,
    cap_secs: f64,
) -> Result<(i32, DateTime<Utc>)> {
    let row: (i32, DateTime<Utc>) = sqlx::query_as(live_where!(
        "UPDATE tickets \
         SET failed_reactivation_attempts = failed_reactivation_attempts + 1, \
             cooldown_until = $1 + make_interval(secs => \
                 LEAST($2::float8 * power(2::float8, failed_reactivation_attempts::float8), \
                       $3::float8)) \
         WHERE id = $4",
        "RETURNING failed_reactivation_attempts, cooldown_until"
    ))
    .bind(now)
    .bind(base_secs)
    .bind(cap_secs)
    .bind(id)
    .fetch_one(pool)
    .await
    .context("failed to enter cooldown")?;

    Ok(row)
}

/// Bump the reactivation counter when a child run is spawned.
pub async fn increment_reactivation_count(pool: &PgPool, id: Uuid) -> Result<i32> {
    let row: (i32,) = sqlx::query_as(live_where!(
        "UPDATE tickets \
         SET reactivation_count = reactivation_count + 1 \
         WHERE id = $1",
        "RETURNING reactivation_count"
    ))
    .bind(id)
    .fetch_one(pool)
    .await
    .context("failed to increment reactivation count")?;

    Ok(row.0)
}

/// Soft-delete a ticket. Subsequent reads will not see it and writes against
/// it fail with `ModifyDeleted`.
pub async fn soft_delete_ticket(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(live_where!(
        "UPDATE tickets SET deleted_at = NOW() WHERE id = $1"
    ))
    .bind(id)
    .execute(pool)
    .await
    .context("failed to soft-delete ticket")?;

    Ok(result.rows_affected())
}
