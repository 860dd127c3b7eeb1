//! Read-side access to the status-registry reference tables.
//!
//! The tables are seeded by migration; the in-process `StatusRegistry` in
//! `conductor-core` loads them once at bootstrap.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{StatusTransitionRow, StatusTypeRow};

/// Load every status type, ordered for stable comparison against the
/// canonical seed.
pub async fn load_status_types(pool: &PgPool) -> Result<Vec<StatusTypeRow>> {
    let rows = sqlx::query_as::<_, StatusTypeRow>(
        "SELECT category, name, is_terminal \
         FROM status_types \
         ORDER BY category, name",
    )
    .fetch_all(pool)
    .await
    .context("failed to load status types")?;

    Ok(rows)
}

/// Load every allowed transition, ordered for stable comparison against the
/// canonical seed.
pub async fn load_status_transitions(pool: &PgPool) -> Result<Vec<StatusTransitionRow>> {
    let rows = sqlx::query_as::<_, StatusTransitionRow>(
        "SELECT category, from_status, to_status \
         FROM status_transitions \
         ORDER BY category, from_status, to_status",
    )
    .fetch_all(pool)
    .await
    .context("failed to load status transitions")?;

    Ok(rows)
}
