//! Database query functions for the `reactivation_triggers` audit table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ReactivationAction, ReactivationClassification, ReactivationTrigger};

/// Record one reactivation decision (spawned a child run, or why not).
pub async fn insert_trigger(
    pool: &PgPool,
    ticket_id: Uuid,
    classification: ReactivationClassification,
    action: ReactivationAction,
    run_id: Option<Uuid>,
    detail: Option<&str>,
) -> Result<ReactivationTrigger> {
    let trigger = sqlx::query_as::<_, ReactivationTrigger>(
        "INSERT INTO reactivation_triggers (ticket_id, classification, action, run_id, detail) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(ticket_id)
    .bind(classification)
    .bind(action)
    .bind(run_id)
    .bind(detail)
    .fetch_one(pool)
    .await
    .context("failed to insert reactivation trigger")?;

    Ok(trigger)
}

/// List all trigger rows for a ticket, oldest first.
pub async fn list_triggers_for_ticket(
    pool: &PgPool,
    ticket_id: Uuid,
) -> Result<Vec<ReactivationTrigger>> {
    let triggers = sqlx::query_as::<_, ReactivationTrigger>(
        "SELECT * FROM reactivation_triggers \
         WHERE ticket_id = $1 \
         ORDER BY created_at ASC",
    )
    .bind(ticket_id)
    .fetch_all(pool)
    .await
    .context("failed to list reactivation triggers")?;

    Ok(triggers)
}
