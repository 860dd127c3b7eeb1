//! The validation rendezvous: suspend a run awaiting a correlated human
//! response, and match the response back to the exact run that asked.
//!
//! Correlation is by the validation's external UUID and nothing else -- the
//! response channel is not trusted with ticket or run identifiers.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use conductor_db::models::{
    QueueStatus, Run, RunStatus, StepStatus, Ticket, Validation, ValidationDecision,
    ValidationStatus,
};
use conductor_db::queries::{
    queue as queue_db, runs as run_db, steps as step_db, tickets as ticket_db,
    validations as validation_db,
};

use crate::clock::Clock;
use crate::engine;
use crate::error::{OrchestratorError, reasons};
use crate::lock::CooldownManager;
use crate::notify::{Notifier, RunCompleted, ValidationPending};
use crate::orchestrator::Settings;
use crate::transition::TransitionGuard;

/// What a recorded response did to the run, for callers that need to follow
/// up (the reactivation controller acts on `ChangesRequested`).
#[derive(Debug, Clone)]
pub enum ResponseDisposition {
    Approved {
        run_id: Uuid,
    },
    Rejected {
        run_id: Uuid,
        rejections: i32,
    },
    /// The rejection limit was reached; the validation was auto-terminated.
    Abandoned {
        run_id: Uuid,
        rejections: i32,
    },
    ChangesRequested {
        run_id: Uuid,
        ticket_id: Uuid,
        comments: Option<String>,
    },
}

/// The rendezvous between suspended runs and asynchronous human responses.
pub struct ValidationRendezvous {
    pool: PgPool,
    guard: TransitionGuard,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    cooldown: Arc<CooldownManager>,
    settings: Settings,
}

impl ValidationRendezvous {
    pub fn new(
        pool: PgPool,
        guard: TransitionGuard,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        cooldown: Arc<CooldownManager>,
        settings: Settings,
    ) -> Self {
        Self {
            pool,
            guard,
            clock,
            notifier,
            cooldown,
            settings,
        }
    }

    /// Open a pending validation for a run and emit the notification.
    ///
    /// Idempotent per run: if a pending validation already exists (the
    /// handler was re-invoked after a crash between create and suspend), it
    /// is reused. The rejection count and parent linkage are inherited from
    /// the parent run's most recent validation so the chain limit survives
    /// reactivation.
    pub async fn open(
        &self,
        run: &Run,
        step_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<Validation> {
        if let Some(existing) = validation_db::pending_validation_for_run(&self.pool, run.id).await?
        {
            return Ok(existing);
        }

        let (inherited_rejections, parent_validation) = match run.parent_run_id {
            Some(parent_run_id) => {
                let chain = validation_db::list_validations_for_run(&self.pool, parent_run_id)
                    .await?;
                match chain.last() {
                    Some(v) => (v.rejection_count, Some(v.id)),
                    None => (0, None),
                }
            }
            None => (0, None),
        };

        let expires_at = self.clock.now()
            + chrono::Duration::from_std(self.settings.validation_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(72));

        let validation = validation_db::insert_validation(
            &self.pool,
            run.id,
            step_id,
            &payload,
            expires_at,
            inherited_rejections,
            parent_validation,
        )
        .await?;

        self.notifier
            .notify_validation_pending(ValidationPending {
                uuid: validation.external_uuid,
                ticket_id: run.ticket_id,
                run_id: run.id,
                validator_hint: None,
                payload: validation.payload.clone(),
            })
            .await;

        info!(
            run_id = %run.id,
            uuid = %validation.external_uuid,
            expires_at = %validation.expires_at,
            "validation opened"
        );

        Ok(validation)
    }

    /// Record a human response for the validation identified by `uuid`.
    ///
    /// Idempotent: a second call for the same uuid fails with
    /// `ValidationConflict` and leaves the stored response untouched. A
    /// response after `expires_at` fails with `ValidationExpired` (and the
    /// validation is expired on the spot rather than waiting for the
    /// sweeper).
    pub async fn record_response(
        &self,
        uuid: Uuid,
        decision: ValidationDecision,
        comments: Option<&str>,
        validator_id: &str,
    ) -> Result<ResponseDisposition> {
        let validation = validation_db::get_by_external_uuid(&self.pool, uuid)
            .await?
            .ok_or(OrchestratorError::NotFound {
                entity: "validation",
                id: uuid,
            })?;

        if validation.status != ValidationStatus::Pending {
            return Err(OrchestratorError::ValidationConflict { uuid }.into());
        }

        let now = self.clock.now();
        if validation.expires_at <= now {
            self.handle_expired(&validation).await?;
            return Err(OrchestratorError::ValidationExpired {
                uuid,
                expires_at: validation.expires_at,
            }
            .into());
        }

        let inserted = validation_db::insert_response(
            &self.pool,
            validation.id,
            decision,
            comments,
            validator_id,
            now,
        )
        .await?;
        if inserted == 0 {
            // Lost a race with another response for the same uuid.
            return Err(OrchestratorError::ValidationConflict { uuid }.into());
        }

        let run = run_db::get_run(&self.pool, validation.run_id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                entity: "run",
                id: validation.run_id,
            })?;
        let ticket = ticket_db::get_ticket(&self.pool, run.ticket_id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                entity: "ticket",
                id: run.ticket_id,
            })?;

        match decision {
            ValidationDecision::Approved => self.resume_approved(&validation, &run, &ticket).await,
            ValidationDecision::Rejected => self.reject(&validation, &run, &ticket).await,
            ValidationDecision::ChangesRequested => {
                self.request_changes(&validation, &run, &ticket, comments)
                    .await
            }
        }
    }

    /// Approved: close the suspended step, wake the run, and hand the queue
    /// entry back to the dispatcher so the `merge` step proceeds.
    async fn resume_approved(
        &self,
        validation: &Validation,
        run: &Run,
        ticket: &Ticket,
    ) -> Result<ResponseDisposition> {
        let now = self.clock.now();

        self.guard
            .validation(
                &self.pool,
                validation.id,
                ValidationStatus::Pending,
                ValidationStatus::Approved,
                "rendezvous",
                None,
            )
            .await?;

        step_db::set_step_output(
            &self.pool,
            validation.step_id,
            &serde_json::json!({ "decision": "approved", "validation": validation.external_uuid }),
        )
        .await?;
        self.guard
            .step(
                &self.pool,
                validation.step_id,
                StepStatus::Running,
                StepStatus::Completed,
                "rendezvous",
                Some("validation_approved"),
                None,
                Some(now),
            )
            .await?;
        engine::update_progress(&self.pool, run.id).await?;

        self.guard
            .run(
                &self.pool,
                run.id,
                RunStatus::WaitingValidation,
                RunStatus::Running,
                "rendezvous",
                None,
                None,
                None,
            )
            .await?;

        if let Some(entry) = queue_db::bound_entry_for_item(&self.pool, &ticket.external_id).await?
        {
            self.guard
                .queue_entry(
                    &self.pool,
                    entry.id,
                    QueueStatus::WaitingValidation,
                    QueueStatus::Running,
                    "rendezvous",
                    Some("validation_approved"),
                    None,
                )
                .await?;
        } else {
            warn!(run_id = %run.id, "approved run has no bound queue entry");
        }

        Ok(ResponseDisposition::Approved { run_id: run.id })
    }

    /// Rejected: fail the run. Below the chain limit the ticket becomes
    /// reactivatable on the next inbound message; at the limit the
    /// validation is auto-terminated as abandoned.
    async fn reject(
        &self,
        validation: &Validation,
        run: &Run,
        ticket: &Ticket,
    ) -> Result<ResponseDisposition> {
        let rejections = validation_db::increment_rejection_count(&self.pool, validation.id).await?;
        let limit_reached = rejections >= self.settings.max_rejections;

        let (to_status, reason) = if limit_reached {
            (ValidationStatus::Abandoned, reasons::VALIDATION_ABANDONED_LIMIT)
        } else {
            (ValidationStatus::Rejected, reasons::VALIDATION_REJECTED)
        };

        self.guard
            .validation(
                &self.pool,
                validation.id,
                ValidationStatus::Pending,
                to_status,
                "rendezvous",
                Some(reason),
            )
            .await?;

        self.fail_suspended_run(validation, run, ticket, reason).await?;

        if limit_reached {
            warn!(
                run_id = %run.id,
                rejections = rejections,
                "validation chain hit the rejection limit; abandoned"
            );
            Ok(ResponseDisposition::Abandoned {
                run_id: run.id,
                rejections,
            })
        } else {
            Ok(ResponseDisposition::Rejected {
                run_id: run.id,
                rejections,
            })
        }
    }

    /// Changes requested: fail the run with the comments preserved; the
    /// reactivation controller spawns the child run that carries them.
    async fn request_changes(
        &self,
        validation: &Validation,
        run: &Run,
        ticket: &Ticket,
        comments: Option<&str>,
    ) -> Result<ResponseDisposition> {
        self.guard
            .validation(
                &self.pool,
                validation.id,
                ValidationStatus::Pending,
                ValidationStatus::ChangesRequested,
                "rendezvous",
                Some(reasons::CHANGES_REQUESTED),
            )
            .await?;

        self.fail_suspended_run(validation, run, ticket, reasons::CHANGES_REQUESTED)
            .await?;

        Ok(ResponseDisposition::ChangesRequested {
            run_id: run.id,
            ticket_id: ticket.id,
            comments: comments.map(str::to_owned),
        })
    }

    /// Expire a pending validation and fail its run. Called by the sweeper
    /// (and inline when a response arrives late).
    pub async fn handle_expired(&self, validation: &Validation) -> Result<()> {
        // The sweeper's bulk UPDATE may have already moved it to expired;
        // only transition when we are the ones catching it.
        if validation.status == ValidationStatus::Pending {
            self.guard
                .validation(
                    &self.pool,
                    validation.id,
                    ValidationStatus::Pending,
                    ValidationStatus::Expired,
                    "rendezvous",
                    Some(reasons::VALIDATION_EXPIRED),
                )
                .await?;
        }

        let Some(run) = run_db::get_run(&self.pool, validation.run_id).await? else {
            return Ok(());
        };
        if run.status.is_terminal() {
            return Ok(());
        }
        let ticket = ticket_db::get_ticket(&self.pool, run.ticket_id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                entity: "ticket",
                id: run.ticket_id,
            })?;

        self.fail_suspended_run(validation, &run, &ticket, reasons::VALIDATION_EXPIRED)
            .await?;

        // An expired validation embargoes the ticket: a webhook right after
        // expiry must see TicketCoolingDown with the first-failure backoff.
        let (attempts, until) = self.cooldown.enter(ticket.id).await?;
        warn!(
            ticket_id = %ticket.id,
            attempts = attempts,
            until = %until,
            "validation expired; ticket entered cooldown"
        );
        Ok(())
    }

    /// Shared teardown for every negative outcome of a suspended run: the
    /// suspended step, the run, the queue entry, and the ticket all fail
    /// with the same reason, and completion is notified.
    async fn fail_suspended_run(
        &self,
        validation: &Validation,
        run: &Run,
        ticket: &Ticket,
        reason: &str,
    ) -> Result<()> {
        let now = self.clock.now();

        self.guard
            .step(
                &self.pool,
                validation.step_id,
                StepStatus::Running,
                StepStatus::Failed,
                "rendezvous",
                Some(reason),
                None,
                Some(now),
            )
            .await
            .context("failed to fail suspended step")?;

        self.guard
            .run(
                &self.pool,
                run.id,
                RunStatus::WaitingValidation,
                RunStatus::Failed,
                "rendezvous",
                Some(reason),
                None,
                Some(now),
            )
            .await
            .context("failed to fail suspended run")?;

        if let Some(entry) = queue_db::bound_entry_for_item(&self.pool, &ticket.external_id).await?
        {
            self.guard
                .queue_entry(
                    &self.pool,
                    entry.id,
                    QueueStatus::WaitingValidation,
                    QueueStatus::Failed,
                    "rendezvous",
                    Some(reason),
                    Some(now),
                )
                .await?;
        }

        if ticket.status == conductor_db::models::TicketStatus::AwaitingValidation {
            self.guard
                .ticket(
                    &self.pool,
                    ticket.id,
                    conductor_db::models::TicketStatus::AwaitingValidation,
                    conductor_db::models::TicketStatus::Failed,
                    "rendezvous",
                    Some(reason),
                )
                .await?;
        }

        self.notifier
            .notify_run_completed(RunCompleted {
                ticket_id: ticket.id,
                run_id: run.id,
                outcome: "failed".to_owned(),
                reason: Some(reason.to_owned()),
            })
            .await;

        Ok(())
    }
}
