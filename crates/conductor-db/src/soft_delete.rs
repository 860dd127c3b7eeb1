//! Soft-delete discipline.
//!
//! Rows with `deleted_at IS NOT NULL` are invisible to every read and
//! unwritable. All query modules compose the filter through [`live_where!`]
//! instead of ad-hoc WHERE clauses, and classify zero-row optimistic updates
//! through [`row_state`] so a write against a soft-deleted row surfaces as
//! `ModifyDeleted` rather than a lost race.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

/// Compose the live-row filter onto a WHERE clause at compile time.
///
/// The optional second literal is appended after the filter, for ORDER BY /
/// LIMIT / RETURNING tails:
///
/// ```ignore
/// sqlx::query(live_where!("SELECT * FROM tickets WHERE id = $1"))
/// sqlx::query(live_where!("SELECT * FROM runs WHERE ticket_id = $1",
///                         "ORDER BY run_number ASC"))
/// ```
#[macro_export]
macro_rules! live_where {
    ($sql:literal) => {
        concat!($sql, " AND deleted_at IS NULL")
    };
    ($sql:literal, $tail:literal) => {
        concat!($sql, " AND deleted_at IS NULL ", $tail)
    };
}

/// Why a row was not touched by an optimistic UPDATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    /// The row exists and is live; the WHERE predicate (expected status,
    /// holder, ...) did not match -- the caller lost a race.
    Live,
    /// The row is soft-deleted; writes against it must fail.
    Deleted,
    /// No such row.
    Missing,
}

/// Tables the [`row_state`] probe may be pointed at.
///
/// A closed set: table names are interpolated into SQL and must never come
/// from caller input.
const PROBE_TABLES: &[&str] = &[
    "tickets",
    "runs",
    "run_steps",
    "validations",
    "queue_entries",
];

/// Probe whether a row is live, soft-deleted, or missing.
///
/// Used after a compare-and-update affected zero rows to decide between
/// `ConcurrentStatusChange`, `ModifyDeleted`, and not-found.
pub async fn row_state(pool: &PgPool, table: &str, id: Uuid) -> Result<RowState> {
    assert!(
        PROBE_TABLES.contains(&table),
        "row_state called with unknown table {table:?}"
    );

    let query = format!("SELECT deleted_at IS NOT NULL FROM {table} WHERE id = $1");
    let row: Option<(bool,)> = sqlx::query_as(&query)
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to probe row state in {table}"))?;

    Ok(match row {
        None => RowState::Missing,
        Some((true,)) => RowState::Deleted,
        Some((false,)) => RowState::Live,
    })
}

#[cfg(test)]
mod tests {
    #[test]
    fn live_where_appends_filter() {
        let sql = live_where!("SELECT * FROM tickets WHERE id = $1");
        assert_eq!(
            sql,
            "SELECT * FROM tickets WHERE id = $1 AND deleted_at IS NULL"
        );
    }
}
