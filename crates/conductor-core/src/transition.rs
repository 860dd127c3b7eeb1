//! The single pre-write validator for status changes.
//!
//! Every status write in the core goes through [`TransitionGuard`]:
//! registry check first, then the compare-and-update in `conductor-db`,
//! then -- on zero rows affected -- a probe to tell a lost race apart from a
//! missing or soft-deleted row. Lost races are retried a bounded number of
//! times before surfacing as `Conflict`. History rows are appended by
//! database trigger, so a transition that commits is always recorded.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use conductor_db::models::{QueueStatus, RunStatus, StepStatus, TicketStatus, ValidationStatus};
use conductor_db::queries::{queue as queue_db, runs as run_db, steps as step_db,
    tickets as ticket_db, validations as validation_db};
use conductor_db::soft_delete::{self, RowState};

use crate::error::OrchestratorError;
use crate::registry::StatusRegistry;

/// How many times a compare-and-update is retried after losing its race.
const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Registry-validated status writes.
#[derive(Clone)]
pub struct TransitionGuard {
    registry: Arc<StatusRegistry>,
}

impl TransitionGuard {
    pub fn new(registry: Arc<StatusRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &StatusRegistry {
        &self.registry
    }

    fn check(&self, category: &'static str, from: &str, to: &str) -> Result<()> {
        if !self.registry.is_transition_allowed(category, from, to) {
            return Err(OrchestratorError::InvalidTransition {
                category,
                from: from.to_owned(),
                to: to.to_owned(),
            }
            .into());
        }
        Ok(())
    }

    /// Shared retry-and-classify loop around a compare-and-update.
    async fn attempt_write<F, Fut>(
        &self,
        pool: &PgPool,
        entity: &'static str,
        table: &'static str,
        id: Uuid,
        mut write: F,
    ) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<u64>>,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let rows = write().await?;
            if rows > 0 {
                return Ok(());
            }

            match soft_delete::row_state(pool, table, id).await? {
                RowState::Missing => {
                    return Err(OrchestratorError::NotFound { entity, id }.into());
                }
                RowState::Deleted => {
                    return Err(OrchestratorError::ModifyDeleted { entity, id }.into());
                }
                RowState::Live => {
                    warn!(
                        entity = entity,
                        id = %id,
                        attempt = attempt,
                        "status compare-and-update lost its race"
                    );
                    if attempt == MAX_WRITE_ATTEMPTS {
                        return Err(OrchestratorError::Conflict {
                            entity,
                            id,
                            attempts: MAX_WRITE_ATTEMPTS,
                        }
                        .into());
                    }
                }
            }
        }
        unreachable!("write loop returns within MAX_WRITE_ATTEMPTS iterations")
    }

    /// Transition a ticket through a registry-validated edge.
    pub async fn ticket(
        &self,
        pool: &PgPool,
        id: Uuid,
        from: TicketStatus,
        to: TicketStatus,
        changed_by: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        self.check("task", &from.to_string(), &to.to_string())?;
        self.attempt_write(pool, "ticket", "tickets", id, async || {
            ticket_db::transition_ticket_status(pool, id, from, to, changed_by, reason).await
        })
        .await
    }

    /// Transition a run through a registry-validated edge.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        pool: &PgPool,
        id: Uuid,
        from: RunStatus,
        to: RunStatus,
        changed_by: &str,
        failure_reason: Option<&str>,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.check("run", &from.to_string(), &to.to_string())?;
        self.attempt_write(pool, "run", "runs", id, async || {
            run_db::transition_run_status(
                pool,
                id,
                from,
                to,
                changed_by,
                failure_reason,
                started_at,
                completed_at,
            )
            .await
        })
        .await
    }

    /// Transition a step through a registry-validated edge.
    ///
    /// A step may only enter `running` when every prior step of its run is
    /// `completed` or `skipped`; this is the ordering guarantee readers rely
    /// on.
    #[allow(clippy::too_many_arguments)]
    pub async fn step(
        &self,
        pool: &PgPool,
        id: Uuid,
        from: StepStatus,
        to: StepStatus,
        changed_by: &str,
        reason: Option<&str>,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.check("step", &from.to_string(), &to.to_string())?;

        if to == StepStatus::Running {
            let step = step_db::get_step(pool, id)
                .await?
                .ok_or(OrchestratorError::NotFound {
                    entity: "step",
                    id,
                })?;
            let blocked =
                step_db::incomplete_predecessors(pool, step.run_id, step.step_order).await?;
            if blocked > 0 {
                return Err(OrchestratorError::InvalidTransition {
                    category: "step",
                    from: from.to_string(),
                    to: format!("{to} ({blocked} predecessor(s) incomplete)"),
                }
                .into());
            }
        }

        self.attempt_write(pool, "step", "run_steps", id, async || {
            step_db::transition_step_status(
                pool,
                id,
                from,
                to,
                changed_by,
                reason,
                started_at,
                completed_at,
            )
            .await
        })
        .await
    }

    /// Transition a queue entry through a registry-validated edge.
    pub async fn queue_entry(
        &self,
        pool: &PgPool,
        id: Uuid,
        from: QueueStatus,
        to: QueueStatus,
        changed_by: &str,
        reason: Option<&str>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.check("queue", &from.to_string(), &to.to_string())?;
        self.attempt_write(pool, "queue entry", "queue_entries", id, async || {
            queue_db::transition_queue_status(pool, id, from, to, changed_by, reason, completed_at)
                .await
        })
        .await
    }

    /// Transition a validation through a registry-validated edge.
    pub async fn validation(
        &self,
        pool: &PgPool,
        id: Uuid,
        from: ValidationStatus,
        to: ValidationStatus,
        changed_by: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        self.check("validation", &from.to_string(), &to.to_string())?;
        self.attempt_write(pool, "validation", "validations", id, async || {
            validation_db::transition_validation_status(pool, id, from, to, changed_by, reason)
                .await
        })
        .await
    }
}
