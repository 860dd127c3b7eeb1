//! Periodic maintenance: stale-lock release, validation expiry, queue
//! timeouts, dedup-window pruning, and the cancel watchdog.
//!
//! Each concern is a single SQL sweep plus per-row follow-up; the interval
//! is bounded by TTL/3 so a stale lock never outlives its TTL by more than
//! one sweep.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use conductor_db::models::{QueueStatus, RunStatus, StepStatus, TicketStatus, ValidationStatus};
use conductor_db::queries::{
    events as event_db, queue as queue_db, runs as run_db, steps as step_db,
    tickets as ticket_db, validations as validation_db,
};

use crate::error::reasons;
use crate::notify::RunCompleted;
use crate::orchestrator::OrchestratorContext;

/// Counts from one sweep pass, for logging and the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub locks_released: usize,
    pub validations_expired: usize,
    pub entries_timed_out: usize,
    pub dedup_pruned: u64,
    pub cancels_signalled: usize,
}

pub struct Sweeper {
    ctx: Arc<OrchestratorContext>,
}

impl Sweeper {
    pub fn new(ctx: Arc<OrchestratorContext>) -> Self {
        Self { ctx }
    }

    /// The sweep cadence: TTL/3, capped at one minute so validation expiry
    /// and queue timeouts stay responsive under long lock TTLs.
    pub fn interval(&self) -> Duration {
        (self.ctx.settings.lock_ttl / 3).min(Duration::from_secs(60))
    }

    /// Run periodic sweeps until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let interval = self.interval();
        info!(interval_secs = interval.as_secs(), "sweeper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => {
                    info!("sweeper stopped");
                    return;
                }
            }

            match self.sweep_once().await {
                Ok(report) => {
                    if report.locks_released > 0
                        || report.validations_expired > 0
                        || report.entries_timed_out > 0
                        || report.cancels_signalled > 0
                    {
                        info!(
                            locks = report.locks_released,
                            validations = report.validations_expired,
                            timeouts = report.entries_timed_out,
                            cancels = report.cancels_signalled,
                            "sweep pass"
                        );
                    }
                }
                Err(err) => error!(error = %err, "sweep pass failed"),
            }
        }
    }

    /// One full sweep pass.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport {
            locks_released: self.sweep_locks().await?,
            ..Default::default()
        };
        report.validations_expired = self.sweep_validations().await?;
        report.entries_timed_out = self.sweep_queue_timeouts().await?;
        report.dedup_pruned = self.prune_dedup().await?;
        report.cancels_signalled = self.watch_cancels().await?;
        Ok(report)
    }

    /// Force-release locks past their TTL. Public alone for
    /// `conductor sweep --locks`.
    pub async fn sweep_locks(&self) -> Result<usize> {
        let broken = self.ctx.lock.sweep().await?;
        Ok(broken.len())
    }

    /// Expire pending validations past their deadline and fail their runs.
    async fn sweep_validations(&self) -> Result<usize> {
        let expired = validation_db::sweep_expired(&self.ctx.pool, self.ctx.clock.now()).await?;
        let count = expired.len();
        let rendezvous = self.ctx.rendezvous();
        for validation in expired {
            if let Err(err) = rendezvous.handle_expired(&validation).await {
                error!(
                    validation_id = %validation.id,
                    error = %err,
                    "failed to tear down expired validation"
                );
            }
        }
        Ok(count)
    }

    /// Time out queue entries past their wall-clock budget and fail the
    /// bound runs with `orchestrator_timeout`, signalling their handlers.
    async fn sweep_queue_timeouts(&self) -> Result<usize> {
        let expired = queue_db::sweep_timeouts(&self.ctx.pool, self.ctx.clock.now()).await?;
        let count = expired.len();

        for entry in expired {
            warn!(
                entry_id = %entry.id,
                item_id = %entry.item_id,
                "queue entry exceeded its wall-clock budget"
            );

            if let Some(handle) = entry.dispatch_handle.as_deref() {
                let _ = self.ctx.broker.cancel(handle).await;
            }

            let Some(ticket) =
                ticket_db::get_ticket_by_external_id(&self.ctx.pool, &entry.item_id).await?
            else {
                continue;
            };
            let Some(run) = run_db::active_run_for_ticket(&self.ctx.pool, ticket.id).await? else {
                continue;
            };

            // The worker may still be executing; fire its token so the
            // handler stops, then fail the run. Compare-and-update keeps a
            // racing worker-side transition from double-writing.
            self.ctx.cancel_run_token(run.id);

            if let Some(step) = step_db::running_step(&self.ctx.pool, run.id).await? {
                let _ = self
                    .ctx
                    .guard
                    .step(
                        &self.ctx.pool,
                        step.id,
                        StepStatus::Running,
                        StepStatus::Failed,
                        "sweeper",
                        Some(reasons::ORCHESTRATOR_TIMEOUT),
                        None,
                        Some(self.ctx.clock.now()),
                    )
                    .await;
            }

            let from = run.status;
            if matches!(from, RunStatus::Running | RunStatus::WaitingValidation) {
                let _ = self
                    .ctx
                    .guard
                    .run(
                        &self.ctx.pool,
                        run.id,
                        from,
                        RunStatus::Failed,
                        "sweeper",
                        Some(reasons::ORCHESTRATOR_TIMEOUT),
                        None,
                        Some(self.ctx.clock.now()),
                    )
                    .await;
            }

            if self.ctx.registry.is_transition_allowed(
                "task",
                &ticket.status.to_string(),
                &TicketStatus::Failed.to_string(),
            ) {
                let _ = self
                    .ctx
                    .guard
                    .ticket(
                        &self.ctx.pool,
                        ticket.id,
                        ticket.status,
                        TicketStatus::Failed,
                        "sweeper",
                        Some(reasons::ORCHESTRATOR_TIMEOUT),
                    )
                    .await;
            }

            self.ctx
                .notifier
                .notify_run_completed(RunCompleted {
                    ticket_id: ticket.id,
                    run_id: run.id,
                    outcome: "failed".to_owned(),
                    reason: Some(reasons::ORCHESTRATOR_TIMEOUT.to_owned()),
                })
                .await;
        }

        Ok(count)
    }

    async fn prune_dedup(&self) -> Result<u64> {
        let cutoff = self.ctx.clock.now()
            - chrono::Duration::from_std(self.ctx.settings.dedup_window)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        event_db::prune_dedup(&self.ctx.pool, cutoff).await
    }

    /// Fire cancellation tokens for runs flagged `cancel_requested`, and
    /// directly cancel suspended runs that hold no worker.
    async fn watch_cancels(&self) -> Result<usize> {
        let pending = run_db::list_cancel_requested(&self.ctx.pool).await?;
        let mut signalled = 0;

        for run in pending {
            if self.ctx.cancel_run_token(run.id) {
                signalled += 1;
                continue;
            }

            // No worker bound: a run suspended in waiting_validation can be
            // cancelled directly.
            if run.status == RunStatus::WaitingValidation {
                signalled += 1;
                self.cancel_suspended_run(&run).await?;
            }
        }

        Ok(signalled)
    }

    async fn cancel_suspended_run(&self, run: &conductor_db::models::Run) -> Result<()> {
        let now = self.ctx.clock.now();

        if let Some(validation) =
            validation_db::pending_validation_for_run(&self.ctx.pool, run.id).await?
        {
            let _ = self
                .ctx
                .guard
                .validation(
                    &self.ctx.pool,
                    validation.id,
                    ValidationStatus::Pending,
                    ValidationStatus::Abandoned,
                    "sweeper",
                    Some(reasons::CANCELLED),
                )
                .await;
            let _ = self
                .ctx
                .guard
                .step(
                    &self.ctx.pool,
                    validation.step_id,
                    StepStatus::Running,
                    StepStatus::Failed,
                    "sweeper",
                    Some(reasons::CANCELLED),
                    None,
                    Some(now),
                )
                .await;
        }

        self.ctx
            .guard
            .run(
                &self.ctx.pool,
                run.id,
                RunStatus::WaitingValidation,
                RunStatus::Cancelled,
                "sweeper",
                Some(reasons::CANCELLED),
                None,
                Some(now),
            )
            .await?;

        if let Some(ticket) = ticket_db::get_ticket(&self.ctx.pool, run.ticket_id).await? {
            if let Some(entry) =
                queue_db::bound_entry_for_item(&self.ctx.pool, &ticket.external_id).await?
            {
                let _ = self
                    .ctx
                    .guard
                    .queue_entry(
                        &self.ctx.pool,
                        entry.id,
                        QueueStatus::WaitingValidation,
                        QueueStatus::Cancelled,
                        "sweeper",
                        Some(reasons::CANCELLED),
                        Some(now),
                    )
                    .await;
            }
            if self.ctx.registry.is_transition_allowed(
                "task",
                &ticket.status.to_string(),
                &TicketStatus::Failed.to_string(),
            ) {
                let _ = self
                    .ctx
                    .guard
                    .ticket(
                        &self.ctx.pool,
                        ticket.id,
                        ticket.status,
                        TicketStatus::Failed,
                        "sweeper",
                        Some(reasons::CANCELLED),
                    )
                    .await;
            }
        }

        Ok(())
    }
}
