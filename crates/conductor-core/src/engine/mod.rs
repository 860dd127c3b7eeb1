//! The run engine: drives a run through its ordered steps, persisting a
//! checkpoint trail as it goes.
//!
//! One engine invocation owns one claimed queue entry from lock acquisition
//! to a terminal (or suspended) state. Step semantics live in registered
//! [`crate::handler::StepHandler`]s; the engine only maps their outcome
//! variants onto the state machine.

pub mod recovery;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use conductor_db::models::{
    QueueEntry, QueueStatus, Run, RunStatus, RunStep, StepName, StepStatus, Ticket, TicketStatus,
    CANONICAL_STEPS, REACTIVATION_STEPS,
};
use conductor_db::queries::{
    queue as queue_db, runs as run_db, steps as step_db, tickets as ticket_db,
};

use crate::error::{reasons, OrchestratorError};
use crate::handler::{StepContext, StepOutcome};
use crate::notify::RunCompleted;
use crate::orchestrator::OrchestratorContext;

/// How one engine invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveOutcome {
    /// Every step completed; the run, entry, and ticket are `completed`.
    Completed,
    /// The run failed with the given reason.
    Failed(String),
    /// The run suspended awaiting an external signal; the engine unbound.
    Suspended,
    /// A cancel request was honoured.
    Cancelled,
}

/// Recompute and persist a run's progress percentage.
///
/// `floor(completed / total * 100)`; the write is monotonic so a stale
/// writer can never move progress backwards.
pub async fn update_progress(pool: &PgPool, run_id: Uuid) -> Result<i32> {
    let (done, total) = step_db::step_progress_counts(pool, run_id).await?;
    let percentage = if total == 0 {
        0
    } else {
        ((done * 100) / total) as i32
    };
    run_db::set_progress(pool, run_id, percentage).await?;
    Ok(percentage)
}

/// The ticket status that mirrors a step entering execution.
fn ticket_status_for_step(step: StepName) -> TicketStatus {
    match step {
        StepName::Test => TicketStatus::Testing,
        StepName::QualityCheck => TicketStatus::QualityCheck,
        StepName::AwaitValidation => TicketStatus::AwaitingValidation,
        _ => TicketStatus::Processing,
    }
}

/// The run engine. Cheap to construct; one per worker invocation.
pub struct RunEngine {
    ctx: Arc<OrchestratorContext>,
}

impl RunEngine {
    pub fn new(ctx: Arc<OrchestratorContext>) -> Self {
        Self { ctx }
    }

    fn pool(&self) -> &PgPool {
        &self.ctx.pool
    }

    /// Execute one claimed queue entry to a terminal or suspended state.
    ///
    /// This is the worker body the dispatcher spawns. The entry is already
    /// `running` with a dispatch handle; everything else -- lock, ticket,
    /// run, steps -- is this function's responsibility.
    pub async fn execute_entry(&self, entry: QueueEntry, cancel: CancellationToken) -> Result<DriveOutcome> {
        let Some(ticket) = ticket_db::get_ticket_by_external_id(self.pool(), &entry.item_id).await?
        else {
            warn!(item_id = %entry.item_id, entry_id = %entry.id, "queue entry has no ticket");
            self.finish_entry(&entry, QueueStatus::Failed, reasons::TICKET_MISSING)
                .await?;
            return Ok(DriveOutcome::Failed(reasons::TICKET_MISSING.to_owned()));
        };

        // Acquire the advisory lock, waiting out a contending holder. The
        // queue already serializes per item, so contention here means a
        // stale holder; the TTL-steal predicate (or the sweeper) clears it.
        loop {
            if self.ctx.lock.acquire(ticket.id, &self.ctx.settings.holder).await? {
                break;
            }
            tracing::debug!(ticket_id = %ticket.id, "lock busy, waiting");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                _ = cancel.cancelled() => {
                    self.finish_entry(&entry, QueueStatus::Cancelled, reasons::CANCELLED).await?;
                    return Ok(DriveOutcome::Cancelled);
                }
            }
        }

        let result = self.execute_locked(&entry, &ticket, &cancel).await;

        // The lock is released on every exit path except suspension, where
        // it was already released when the engine unbound.
        if !matches!(result, Ok(DriveOutcome::Suspended)) {
            let _ = self
                .ctx
                .lock
                .release(ticket.id, &self.ctx.settings.holder)
                .await;
        }

        result
    }

    async fn execute_locked(
        &self,
        entry: &QueueEntry,
        ticket: &Ticket,
        cancel: &CancellationToken,
    ) -> Result<DriveOutcome> {
        let run = self.bind_run(ticket, entry).await?;

        self.ctx.register_run_token(run.id, cancel.clone());
        let outcome = self.drive(&run, ticket, entry, cancel).await;
        self.ctx.forget_run_token(run.id);

        outcome
    }

    /// Find the run this entry executes, creating it (and its steps) when
    /// this is a fresh dispatch.
    ///
    /// Reactivation entries bind to the run the reactivation controller
    /// already created; resumed entries bind to the run that woke from
    /// `waiting_validation`.
    async fn bind_run(&self, ticket: &Ticket, entry: &QueueEntry) -> Result<Run> {
        if let Some(run) = run_db::active_run_for_ticket(self.pool(), ticket.id).await? {
            // Seed steps if the creator (the reactivation controller) left
            // that to us.
            let steps = step_db::list_steps_for_run(self.pool(), run.id).await?;
            if steps.is_empty() {
                self.seed_steps(&run).await?;
            }
            if run.status == RunStatus::Started {
                self.start_run(&run, ticket).await?;
            }
            run_db::set_dispatch_handle(self.pool(), run.id, entry.dispatch_handle.as_deref().unwrap_or_default())
                .await?;
            return run_db::get_run(self.pool(), run.id)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound { entity: "run", id: run.id }.into());
        }

        let run = run_db::insert_run(self.pool(), ticket.id, entry.is_reactivation, None, 0)
            .await
            .context("failed to create run for entry")?;
        self.seed_steps(&run).await?;
        self.start_run(&run, ticket).await?;
        run_db::set_dispatch_handle(
            self.pool(),
            run.id,
            entry.dispatch_handle.as_deref().unwrap_or_default(),
        )
        .await?;

        run_db::get_run(self.pool(), run.id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound { entity: "run", id: run.id }.into())
    }

    async fn seed_steps(&self, run: &Run) -> Result<Vec<RunStep>> {
        let names: &[StepName] = if run.is_reactivation {
            &REACTIVATION_STEPS
        } else {
            &CANONICAL_STEPS
        };
        step_db::insert_steps(
            self.pool(),
            run.id,
            names,
            self.ctx.settings.max_step_retries,
        )
        .await
    }

    /// `started -> running`, mirrored on the ticket (`pending ->
    /// processing` for first-class runs; reactivations are already in
    /// `processing`).
    async fn start_run(&self, run: &Run, ticket: &Ticket) -> Result<()> {
        let now = self.ctx.clock.now();
        self.ctx
            .guard
            .run(
                self.pool(),
                run.id,
                RunStatus::Started,
                RunStatus::Running,
                "engine",
                None,
                Some(now),
                None,
            )
            .await?;

        if ticket.status == TicketStatus::Pending {
            self.ctx
                .guard
                .ticket(
                    self.pool(),
                    ticket.id,
                    TicketStatus::Pending,
                    TicketStatus::Processing,
                    "engine",
                    None,
                )
                .await?;
        }
        Ok(())
    }

    /// The step loop.
    async fn drive(
        &self,
        run: &Run,
        ticket: &Ticket,
        entry: &QueueEntry,
        cancel: &CancellationToken,
    ) -> Result<DriveOutcome> {
        loop {
            // Observe cancellation between steps.
            if cancel.is_cancelled() || self.cancel_requested(run.id).await? {
                return self.cancel_run(run, ticket, entry).await;
            }

            let Some(step) = step_db::next_pending_step(self.pool(), run.id).await? else {
                return self.complete_run(run, ticket, entry).await;
            };

            self.mirror_ticket_status(ticket.id, step.step_name).await?;

            let input = self.previous_output(run.id, step.step_order).await?;
            let now = self.ctx.clock.now();
            self.ctx
                .guard
                .step(
                    self.pool(),
                    step.id,
                    StepStatus::Pending,
                    StepStatus::Running,
                    "engine",
                    None,
                    Some(now),
                    None,
                )
                .await?;
            if let Some(ref input) = input {
                step_db::set_step_input(self.pool(), step.id, input).await?;
            }
            run_db::set_current_step(self.pool(), run.id, step.step_name).await?;

            let checkpoint = step_db::latest_checkpoint(self.pool(), step.id)
                .await?
                .map(|cp| cp.checkpoint_data);

            let step_ctx = StepContext {
                ticket_id: ticket.id,
                run_id: run.id,
                step_id: step.id,
                step_name: step.step_name,
                attempt: step.retry_count,
                cancel: cancel.clone(),
            };

            let outcome = match self
                .invoke_with_grace(&step_ctx, input, checkpoint, cancel)
                .await?
            {
                Some(outcome) => outcome,
                None => {
                    // Grace window expired with the handler still running.
                    self.fail_step(&step, reasons::CANCEL_GRACE_EXCEEDED).await?;
                    self.fail_run(run, ticket, entry, reasons::CANCEL_GRACE_EXCEEDED)
                        .await?;
                    return Ok(DriveOutcome::Failed(
                        reasons::CANCEL_GRACE_EXCEEDED.to_owned(),
                    ));
                }
            };

            // A cancel observed mid-step wins over whatever the handler
            // returned; it acknowledged within the grace window.
            if cancel.is_cancelled() {
                self.fail_step(&step, reasons::CANCELLED).await?;
                return self.cancel_run(run, ticket, entry).await;
            }

            match outcome {
                Ok(StepOutcome::Completed(output)) => {
                    step_db::set_step_output(self.pool(), step.id, &output).await?;
                    self.ctx
                        .guard
                        .step(
                            self.pool(),
                            step.id,
                            StepStatus::Running,
                            StepStatus::Completed,
                            "engine",
                            None,
                            None,
                            Some(self.ctx.clock.now()),
                        )
                        .await?;
                    update_progress(self.pool(), run.id).await?;
                }
                Ok(StepOutcome::Suspend { checkpoint }) => {
                    step_db::insert_checkpoint(self.pool(), step.id, &checkpoint).await?;
                    return self.suspend_run(run, ticket, entry).await;
                }
                Ok(StepOutcome::Retry { reason }) => {
                    if let Some(failed) = self.retry_step(run, ticket, &step, &reason, cancel).await? {
                        self.fail_run(run, ticket, entry, &failed).await?;
                        return Ok(DriveOutcome::Failed(failed));
                    }
                }
                Ok(StepOutcome::Fail { reason, retryable }) => {
                    if retryable {
                        if let Some(failed) =
                            self.retry_step(run, ticket, &step, &reason, cancel).await?
                        {
                            self.fail_run(run, ticket, entry, &failed).await?;
                            return Ok(DriveOutcome::Failed(failed));
                        }
                    } else {
                        self.fail_step(&step, &reason).await?;
                        self.fail_run(run, ticket, entry, &reason).await?;
                        return Ok(DriveOutcome::Failed(reason));
                    }
                }
                Err(err) => {
                    // Unclassified handler error: retryable up to the step's
                    // budget.
                    let reason = format!("handler_error: {err:#}");
                    warn!(step_id = %step.id, error = %err, "handler returned an error");
                    if let Some(failed) = self.retry_step(run, ticket, &step, &reason, cancel).await? {
                        self.fail_run(run, ticket, entry, &failed).await?;
                        return Ok(DriveOutcome::Failed(failed));
                    }
                }
            }
        }
    }

    /// Invoke the step handler, honouring the cancel grace window.
    ///
    /// `Ok(None)` means the grace window expired with the handler still
    /// running; `Ok(Some(result))` is the handler's own result, whether or
    /// not cancellation fired while it ran.
    async fn invoke_with_grace(
        &self,
        step_ctx: &StepContext,
        input: Option<serde_json::Value>,
        checkpoint: Option<serde_json::Value>,
        cancel: &CancellationToken,
    ) -> Result<Option<Result<StepOutcome>>> {
        let handler = self
            .ctx
            .handlers
            .get(step_ctx.step_name)
            .ok_or_else(|| anyhow::anyhow!("no handler registered for step {}", step_ctx.step_name))?;

        let mut fut = Box::pin(handler.handle(step_ctx, input, checkpoint));

        tokio::select! {
            result = &mut fut => Ok(Some(result)),
            _ = cancel.cancelled() => {
                match tokio::time::timeout(self.ctx.settings.cancel_grace, &mut fut).await {
                    Ok(result) => Ok(Some(result)),
                    Err(_) => Ok(None),
                }
            }
        }
    }

    /// Requeue a retryable step failure, or report the terminal reason when
    /// the retry budget is exhausted.
    ///
    /// Returns `Some(reason)` when the step (and hence the run) must fail.
    async fn retry_step(
        &self,
        run: &Run,
        ticket: &Ticket,
        step: &RunStep,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        if step.retry_count >= step.max_retries {
            self.fail_step(step, reasons::STEP_RETRIES_EXHAUSTED).await?;
            return Ok(Some(format!(
                "{}: {reason}",
                reasons::STEP_RETRIES_EXHAUSTED
            )));
        }

        let rows =
            step_db::requeue_step_for_retry(self.pool(), step.id, step.retry_count, reason).await?;
        if rows == 0 {
            return Err(OrchestratorError::ConcurrentStatusChange {
                entity: "step",
                id: step.id,
            }
            .into());
        }

        let new_attempt = step.retry_count + 1;
        info!(
            step_id = %step.id,
            step = %step.step_name,
            attempt = new_attempt,
            reason = reason,
            "step requeued for retry"
        );

        // A failing test or implementation pass reads as debugging on the
        // ticket until the retry goes green.
        if matches!(step.step_name, StepName::Test | StepName::Implement) {
            let _ = self.try_mirror(ticket.id, TicketStatus::Debugging).await;
        }

        // Linear, step-local backoff before the next dispatch.
        let backoff = self.ctx.settings.step_retry_backoff * new_attempt as u32;
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.cancelled() => {}
        }

        Ok(None)
    }

    async fn fail_step(&self, step: &RunStep, reason: &str) -> Result<()> {
        self.ctx
            .guard
            .step(
                self.pool(),
                step.id,
                StepStatus::Running,
                StepStatus::Failed,
                "engine",
                Some(reason),
                None,
                Some(self.ctx.clock.now()),
            )
            .await
    }

    /// Output of the latest completed predecessor, which becomes this
    /// step's input.
    async fn previous_output(
        &self,
        run_id: Uuid,
        step_order: i32,
    ) -> Result<Option<serde_json::Value>> {
        let steps = step_db::list_steps_for_run(self.pool(), run_id).await?;
        Ok(steps
            .into_iter()
            .filter(|s| s.step_order < step_order && s.status == StepStatus::Completed)
            .max_by_key(|s| s.step_order)
            .and_then(|s| s.output_data))
    }

    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool> {
        Ok(run_db::get_run(self.pool(), run_id)
            .await?
            .map(|r| r.cancel_requested)
            .unwrap_or(false))
    }

    /// Move the ticket to the status mirroring the step about to execute,
    /// when the registry has an edge for it.
    async fn mirror_ticket_status(&self, ticket_id: Uuid, step: StepName) -> Result<()> {
        let desired = ticket_status_for_step(step);
        self.try_mirror(ticket_id, desired).await
    }

    async fn try_mirror(&self, ticket_id: Uuid, desired: TicketStatus) -> Result<()> {
        let Some(current) = ticket_db::get_ticket(self.pool(), ticket_id).await? else {
            return Ok(());
        };
        if current.status == desired {
            return Ok(());
        }
        if self
            .ctx
            .registry
            .is_transition_allowed("task", &current.status.to_string(), &desired.to_string())
        {
            self.ctx
                .guard
                .ticket(
                    self.pool(),
                    ticket_id,
                    current.status,
                    desired,
                    "engine",
                    None,
                )
                .await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Terminal / suspension paths
    // -------------------------------------------------------------------

    async fn complete_run(
        &self,
        run: &Run,
        ticket: &Ticket,
        entry: &QueueEntry,
    ) -> Result<DriveOutcome> {
        let now = self.ctx.clock.now();

        // Completion resets cooldown bookkeeping and stamps last_run_id via
        // trigger.
        self.ctx
            .guard
            .run(
                self.pool(),
                run.id,
                RunStatus::Running,
                RunStatus::Completed,
                "engine",
                None,
                None,
                Some(now),
            )
            .await?;
        update_progress(self.pool(), run.id).await?;

        let current = ticket_db::get_ticket(self.pool(), ticket.id).await?;
        if let Some(current) = current {
            if self.ctx.registry.is_transition_allowed(
                "task",
                &current.status.to_string(),
                &TicketStatus::Completed.to_string(),
            ) {
                self.ctx
                    .guard
                    .ticket(
                        self.pool(),
                        ticket.id,
                        current.status,
                        TicketStatus::Completed,
                        "engine",
                        None,
                    )
                    .await?;
            }
        }

        self.finish_entry(entry, QueueStatus::Completed, "run_completed").await?;
        self.release_dispatch(run).await;

        self.ctx
            .notifier
            .notify_run_completed(RunCompleted {
                ticket_id: ticket.id,
                run_id: run.id,
                outcome: "completed".to_owned(),
                reason: None,
            })
            .await;

        info!(run_id = %run.id, ticket_id = %ticket.id, "run completed");
        Ok(DriveOutcome::Completed)
    }

    async fn fail_run(
        &self,
        run: &Run,
        ticket: &Ticket,
        entry: &QueueEntry,
        reason: &str,
    ) -> Result<()> {
        let now = self.ctx.clock.now();

        self.ctx
            .guard
            .run(
                self.pool(),
                run.id,
                RunStatus::Running,
                RunStatus::Failed,
                "engine",
                Some(reason),
                None,
                Some(now),
            )
            .await?;

        let _ = self.try_mirror(ticket.id, TicketStatus::Failed).await;
        self.finish_entry(entry, QueueStatus::Failed, reason).await?;
        self.release_dispatch(run).await;

        // A failed reactivation starts (or extends) the cooldown embargo.
        if run.is_reactivation {
            let (attempts, until) = self.ctx.cooldown.enter(ticket.id).await?;
            warn!(
                ticket_id = %ticket.id,
                attempts = attempts,
                until = %until,
                "reactivation run failed; cooldown set"
            );
        }

        self.ctx
            .notifier
            .notify_run_completed(RunCompleted {
                ticket_id: ticket.id,
                run_id: run.id,
                outcome: "failed".to_owned(),
                reason: Some(reason.to_owned()),
            })
            .await;

        warn!(run_id = %run.id, reason = reason, "run failed");
        Ok(())
    }

    async fn cancel_run(
        &self,
        run: &Run,
        ticket: &Ticket,
        entry: &QueueEntry,
    ) -> Result<DriveOutcome> {
        let now = self.ctx.clock.now();

        self.ctx
            .guard
            .run(
                self.pool(),
                run.id,
                RunStatus::Running,
                RunStatus::Cancelled,
                "engine",
                Some(reasons::CANCELLED),
                None,
                Some(now),
            )
            .await?;

        let _ = self.try_mirror(ticket.id, TicketStatus::Failed).await;
        self.finish_entry(entry, QueueStatus::Cancelled, reasons::CANCELLED)
            .await?;
        self.release_dispatch(run).await;

        self.ctx
            .notifier
            .notify_run_completed(RunCompleted {
                ticket_id: ticket.id,
                run_id: run.id,
                outcome: "cancelled".to_owned(),
                reason: Some(reasons::CANCELLED.to_owned()),
            })
            .await;

        info!(run_id = %run.id, "run cancelled");
        Ok(DriveOutcome::Cancelled)
    }

    /// Suspension: the engine unbinds, the worker slot is returned, and only
    /// the rendezvous can wake the run.
    async fn suspend_run(
        &self,
        run: &Run,
        ticket: &Ticket,
        entry: &QueueEntry,
    ) -> Result<DriveOutcome> {
        self.ctx
            .guard
            .run(
                self.pool(),
                run.id,
                RunStatus::Running,
                RunStatus::WaitingValidation,
                "engine",
                None,
                None,
                None,
            )
            .await?;
        self.ctx
            .guard
            .queue_entry(
                self.pool(),
                entry.id,
                QueueStatus::Running,
                QueueStatus::WaitingValidation,
                "engine",
                Some("awaiting_validation"),
                None,
            )
            .await?;

        self.release_dispatch(run).await;

        // Lock discipline during validation waits: the lock is released once
        // the engine has unbound; serialization is carried by the queue
        // entry sitting in waiting_validation.
        self.ctx
            .lock
            .release(ticket.id, &self.ctx.settings.holder)
            .await?;

        info!(run_id = %run.id, ticket_id = %ticket.id, "run suspended awaiting validation");
        Ok(DriveOutcome::Suspended)
    }

    async fn finish_entry(&self, entry: &QueueEntry, to: QueueStatus, reason: &str) -> Result<()> {
        // Re-read: the sweeper may have timed the entry out underneath us.
        let current = queue_db::get_entry(self.pool(), entry.id)
            .await?
            .map(|e| e.status)
            .unwrap_or(entry.status);
        if current.is_terminal() {
            return Ok(());
        }
        self.ctx
            .guard
            .queue_entry(
                self.pool(),
                entry.id,
                current,
                to,
                "engine",
                Some(reason),
                Some(self.ctx.clock.now()),
            )
            .await
    }

    async fn release_dispatch(&self, run: &Run) {
        if let Some(handle) = run.dispatch_handle.as_deref() {
            if let Err(err) = self.ctx.broker.complete(handle).await {
                warn!(run_id = %run.id, error = %err, "failed to complete broker handle");
            }
        }
    }
}
