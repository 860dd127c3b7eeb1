//! The reactivation controller: new user input on a terminal ticket spawns
//! a child run linked to its parent, under cooldown, lock, and depth guards.
//!
//! Every decision -- spawned or skipped, and why -- leaves an audit row in
//! `reactivation_triggers`; `conductor reactivations show` renders the
//! resulting tree.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use conductor_db::models::{
    ReactivationAction, ReactivationClassification, Run, Ticket, TicketStatus,
};
use conductor_db::queries::{
    queue as queue_db, reactivations as trigger_db, runs as run_db, tickets as ticket_db,
};

use crate::error::OrchestratorError;
use crate::orchestrator::OrchestratorContext;

/// Classifies inbound events that reference a terminal ticket. The real
/// analyzer is an external collaborator (an LLM call); the default reads the
/// classification it left in the event payload.
pub trait ReactivationClassifier: Send + Sync {
    fn classify(&self, ticket: &Ticket, payload: &Value) -> ReactivationClassification;
}

/// Default classifier: trust `payload.classification` when present and
/// well-formed, otherwise treat the event as a new requirement.
#[derive(Debug, Default, Clone, Copy)]
pub struct PayloadClassifier;

impl ReactivationClassifier for PayloadClassifier {
    fn classify(&self, _ticket: &Ticket, payload: &Value) -> ReactivationClassification {
        payload
            .get("classification")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(ReactivationClassification::ReopenWithNewRequirement)
    }
}

/// What the controller decided for one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactivationDecision {
    /// A child run was created and enqueued.
    Reactivated { run_id: Uuid },
    /// Suppressed by the cooldown embargo.
    SkippedCooldown,
    /// The advisory lock was held; the event was dropped with a trigger row.
    SkippedLocked,
    /// The chain is at its depth cap; manual reset required.
    DepthExceeded,
    /// Classified as not actionable.
    Ignored,
}

/// Handle an inbound event referencing a ticket whose runs are all terminal.
///
/// Returns the decision; every branch writes its trigger row first.
pub async fn handle_terminal_ticket_event(
    ctx: &Arc<OrchestratorContext>,
    ticket: &Ticket,
    payload: &Value,
    priority: i32,
) -> Result<ReactivationDecision> {
    let classification = ctx.classifier.classify(ticket, payload);

    if !matches!(
        classification,
        ReactivationClassification::ReopenWithNewRequirement
    ) {
        trigger_db::insert_trigger(
            &ctx.pool,
            ticket.id,
            classification,
            ReactivationAction::SkippedIgnored,
            None,
            Some("handled outside the pipeline"),
        )
        .await?;
        return Ok(ReactivationDecision::Ignored);
    }

    // 1. Cooldown embargo.
    if let Some(until) = ctx.cooldown.embargo_until(ticket) {
        trigger_db::insert_trigger(
            &ctx.pool,
            ticket.id,
            classification,
            ReactivationAction::SkippedCooldown,
            None,
            Some(&format!("cooling down until {until}")),
        )
        .await?;
        info!(ticket_id = %ticket.id, until = %until, "reactivation skipped: cooldown");
        return Ok(ReactivationDecision::SkippedCooldown);
    }

    // 2. Depth cap, checked against the parent before taking the lock.
    let parent = latest_terminal_run(ctx, ticket).await?;
    let depth = parent.as_ref().map(|p| p.reactivation_depth + 1).unwrap_or(1);
    if depth > ctx.settings.max_reactivation_depth {
        trigger_db::insert_trigger(
            &ctx.pool,
            ticket.id,
            classification,
            ReactivationAction::SkippedDepth,
            None,
            Some(&format!("depth {depth} exceeds cap")),
        )
        .await?;
        warn!(ticket_id = %ticket.id, depth = depth, "reactivation depth cap reached");
        return Err(OrchestratorError::ReactivationDepthExceeded {
            ticket_id: ticket.id,
            depth,
            cap: ctx.settings.max_reactivation_depth,
        }
        .into());
    }

    // 3. Advisory lock for the ticket mutation itself; released once the
    //    child run is enqueued (the engine worker re-acquires).
    if !ctx.lock.acquire(ticket.id, &ctx.settings.holder).await? {
        trigger_db::insert_trigger(
            &ctx.pool,
            ticket.id,
            classification,
            ReactivationAction::SkippedLocked,
            None,
            Some("advisory lock held"),
        )
        .await?;
        info!(ticket_id = %ticket.id, "reactivation skipped: locked");
        return Ok(ReactivationDecision::SkippedLocked);
    }

    let result = reactivate_locked(ctx, ticket, classification, payload, priority, parent, depth)
        .await;
    let _ = ctx.lock.release(ticket.id, &ctx.settings.holder).await;
    result
}

async fn reactivate_locked(
    ctx: &Arc<OrchestratorContext>,
    ticket: &Ticket,
    classification: ReactivationClassification,
    payload: &Value,
    priority: i32,
    parent: Option<Run>,
    depth: i32,
) -> Result<ReactivationDecision> {
    // Snapshot previous_status and re-enter processing. completed ->
    // processing and failed -> processing are the two legal re-entries.
    ctx.guard
        .ticket(
            &ctx.pool,
            ticket.id,
            ticket.status,
            TicketStatus::Processing,
            "reactivation",
            Some("reopen_with_new_requirement"),
        )
        .await
        .context("failed to re-enter processing for reactivation")?;

    let run = run_db::insert_run(
        &ctx.pool,
        ticket.id,
        true,
        parent.as_ref().map(|p| p.id),
        depth,
    )
    .await?;
    ticket_db::increment_reactivation_count(&ctx.pool, ticket.id).await?;

    queue_db::enqueue(
        &ctx.pool,
        &ticket.external_id,
        payload,
        priority,
        true,
        ctx.clock.now(),
    )
    .await?;

    trigger_db::insert_trigger(
        &ctx.pool,
        ticket.id,
        classification,
        ReactivationAction::Reactivated,
        Some(run.id),
        None,
    )
    .await?;

    info!(
        ticket_id = %ticket.id,
        run_id = %run.id,
        run_number = run.run_number,
        depth = depth,
        "ticket reactivated"
    );
    Ok(ReactivationDecision::Reactivated { run_id: run.id })
}

/// The run a reactivation chains from: the last successful run when one
/// exists, otherwise the newest terminal run.
///
/// The parent-linkage invariant requires the parent to be terminal; a
/// non-terminal run here would mean the caller misclassified the ticket.
async fn latest_terminal_run(
    ctx: &Arc<OrchestratorContext>,
    ticket: &Ticket,
) -> Result<Option<Run>> {
    if let Some(last_run_id) = ticket.last_run_id {
        if let Some(run) = run_db::get_run(&ctx.pool, last_run_id).await? {
            if run.status.is_terminal() {
                return Ok(Some(run));
            }
        }
    }

    let runs = run_db::list_runs_for_ticket(&ctx.pool, ticket.id).await?;
    Ok(runs
        .into_iter()
        .filter(|r| r.status.is_terminal())
        .max_by_key(|r| r.run_number))
}

/// One node of the reactivation tree report.
#[derive(Debug, Clone)]
pub struct ChainNode {
    pub run: Run,
    pub depth_from_leaf: usize,
}

/// Walk the parent chain from the ticket's newest run, newest first.
/// Depth-bounded by the configured cap, which also enforces cycle safety.
pub async fn reactivation_chain(
    ctx: &Arc<OrchestratorContext>,
    ticket_id: Uuid,
) -> Result<Vec<ChainNode>> {
    let runs = run_db::list_runs_for_ticket(&ctx.pool, ticket_id).await?;
    let Some(newest) = runs.iter().max_by_key(|r| r.run_number) else {
        return Ok(Vec::new());
    };

    let chain = run_db::parent_chain(
        &ctx.pool,
        newest.id,
        ctx.settings.max_reactivation_depth + 1,
    )
    .await?;

    Ok(chain
        .into_iter()
        .enumerate()
        .map(|(i, run)| ChainNode {
            run,
            depth_from_leaf: i,
        })
        .collect())
}
