//! Read-side access to the per-entity status-history tables.
//!
//! History rows are written exclusively by AFTER UPDATE triggers; nothing
//! here (or anywhere else in application code) inserts them.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::StatusHistoryRow;

/// Which entity's history table to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryTable {
    Ticket,
    Run,
    Step,
    Validation,
    QueueEntry,
}

impl HistoryTable {
    /// (table name, entity FK column) -- a closed set, safe to interpolate.
    fn parts(self) -> (&'static str, &'static str) {
        match self {
            Self::Ticket => ("ticket_status_history", "ticket_id"),
            Self::Run => ("run_status_history", "run_id"),
            Self::Step => ("step_status_history", "step_id"),
            Self::Validation => ("validation_status_history", "validation_id"),
            Self::QueueEntry => ("queue_entry_status_history", "queue_entry_id"),
        }
    }
}

/// List the full status history for an entity, in write order (the BIGSERIAL
/// primary key is the ordering authority).
pub async fn list_history(
    pool: &PgPool,
    table: HistoryTable,
    entity_id: Uuid,
) -> Result<Vec<StatusHistoryRow>> {
    let (table_name, fk_column) = table.parts();
    let query = format!(
        "SELECT id, {fk_column} AS entity_id, from_status, to_status, \
                changed_by, reason, changed_at \
         FROM {table_name} \
         WHERE {fk_column} = $1 \
         ORDER BY id ASC"
    );

    let rows = sqlx::query_as::<_, StatusHistoryRow>(&query)
        .bind(entity_id)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to list history from {table_name}"))?;

    Ok(rows)
}

/// List lock-history events for a ticket (acquired / released /
/// force_release), in write order.
pub async fn list_lock_history(pool: &PgPool, ticket_id: Uuid) -> Result<Vec<LockHistoryRow>> {
    let rows = sqlx::query_as::<_, LockHistoryRow>(
        "SELECT id, ticket_id, event, holder, changed_at \
         FROM ticket_lock_history \
         WHERE ticket_id = $1 \
         ORDER BY id ASC",
    )
    .bind(ticket_id)
    .fetch_all(pool)
    .await
    .context("failed to list lock history")?;

    Ok(rows)
}

/// One lock-history event, trigger-written like status history.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LockHistoryRow {
    pub id: i64,
    pub ticket_id: Uuid,
    pub event: String,
    pub holder: Option<String>,
    pub changed_at: chrono::DateTime<chrono::Utc>,
}
