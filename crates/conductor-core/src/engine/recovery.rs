//! Crash recovery and resume scanning.
//!
//! A run whose worker died (process crash, or a validation resume with no
//! worker yet) shows up as: run `running`, owning queue entry `running`, and
//! a dispatch handle the broker no longer considers live. Each such run is
//! either handed back to the dispatcher for re-binding -- resuming a
//! mid-flight step from its checkpoint when the handler allows it -- or
//! failed with `orphan_on_restart`.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use conductor_db::models::{QueueStatus, Run, RunStatus, StepStatus, TicketStatus};
use conductor_db::queries::{queue as queue_db, runs as run_db, steps as step_db, tickets as ticket_db};

use crate::error::reasons;
use crate::notify::RunCompleted;
use crate::orchestrator::OrchestratorContext;

/// A run the dispatcher should re-bind a worker to.
#[derive(Debug, Clone)]
pub struct ResumableRun {
    pub run: Run,
    /// The item whose bound queue entry carries the continuation.
    pub item_id: String,
}

/// Scan for abandoned runs; requeue what can be resumed, fail the rest.
///
/// Safe to call repeatedly: a run whose handle is live is never touched, and
/// the fate of each dead-handle run is decided by its mid-flight step:
///
/// - no step `running` (the run stopped between steps, e.g. woken from
///   validation): resume as-is;
/// - a `running` step whose handler is resumable: reset it to `pending`
///   (keeping checkpoints and the retry counter) and resume;
/// - otherwise: `failed(orphan_on_restart)`, preserving all state for the
///   operator.
pub async fn scan(ctx: &Arc<OrchestratorContext>) -> Result<Vec<ResumableRun>> {
    let candidates = run_db::list_possibly_orphaned_runs(&ctx.pool).await?;
    let mut resumable = Vec::new();

    for run in candidates {
        let handle = run.dispatch_handle.as_deref().unwrap_or_default();
        if ctx.broker.is_live(handle).await {
            continue;
        }

        let ticket = match ticket_db::get_ticket(&ctx.pool, run.ticket_id).await? {
            Some(t) => t,
            None => continue,
        };

        match step_db::running_step(&ctx.pool, run.id).await? {
            None => {
                info!(run_id = %run.id, "re-binding run stopped between steps");
                resumable.push(ResumableRun {
                    run,
                    item_id: ticket.external_id,
                });
            }
            Some(step) => {
                let handler_resumable = ctx
                    .handlers
                    .get(step.step_name)
                    .map(|h| h.resumable())
                    .unwrap_or(false);

                if handler_resumable {
                    // Back to pending without touching the retry counter;
                    // the latest checkpoint rides along to the re-dispatch.
                    ctx.guard
                        .step(
                            &ctx.pool,
                            step.id,
                            StepStatus::Running,
                            StepStatus::Pending,
                            "recovery",
                            Some("resume_after_restart"),
                            None,
                            None,
                        )
                        .await?;
                    info!(
                        run_id = %run.id,
                        step = %step.step_name,
                        "mid-flight step reset for checkpoint resume"
                    );
                    resumable.push(ResumableRun {
                        run,
                        item_id: ticket.external_id,
                    });
                } else {
                    fail_orphan(ctx, &run, &ticket.external_id, &step.step_name.to_string())
                        .await?;
                }
            }
        }
    }

    Ok(resumable)
}

/// Fail a run that cannot be safely resumed, preserving its state for the
/// operator.
async fn fail_orphan(
    ctx: &Arc<OrchestratorContext>,
    run: &Run,
    item_id: &str,
    step_name: &str,
) -> Result<()> {
    warn!(
        run_id = %run.id,
        step = step_name,
        "orphaned run cannot be resumed; failing"
    );
    let now = ctx.clock.now();

    if let Some(step) = step_db::running_step(&ctx.pool, run.id).await? {
        ctx.guard
            .step(
                &ctx.pool,
                step.id,
                StepStatus::Running,
                StepStatus::Failed,
                "recovery",
                Some(reasons::ORPHAN_ON_RESTART),
                None,
                Some(now),
            )
            .await?;
    }

    ctx.guard
        .run(
            &ctx.pool,
            run.id,
            RunStatus::Running,
            RunStatus::Failed,
            "recovery",
            Some(reasons::ORPHAN_ON_RESTART),
            None,
            Some(now),
        )
        .await?;

    if let Some(entry) = queue_db::bound_entry_for_item(&ctx.pool, item_id).await? {
        if !entry.status.is_terminal() {
            ctx.guard
                .queue_entry(
                    &ctx.pool,
                    entry.id,
                    entry.status,
                    QueueStatus::Failed,
                    "recovery",
                    Some(reasons::ORPHAN_ON_RESTART),
                    Some(now),
                )
                .await?;
        }
    }

    if let Some(ticket) = ticket_db::get_ticket(&ctx.pool, run.ticket_id).await? {
        if ctx.registry.is_transition_allowed(
            "task",
            &ticket.status.to_string(),
            &TicketStatus::Failed.to_string(),
        ) {
            ctx.guard
                .ticket(
                    &ctx.pool,
                    ticket.id,
                    ticket.status,
                    TicketStatus::Failed,
                    "recovery",
                    Some(reasons::ORPHAN_ON_RESTART),
                )
                .await?;
        }
    }

    ctx.notifier
        .notify_run_completed(RunCompleted {
            ticket_id: run.ticket_id,
            run_id: run.id,
            outcome: "failed".to_owned(),
            reason: Some(reasons::ORPHAN_ON_RESTART.to_owned()),
        })
        .await;

    Ok(())
}
