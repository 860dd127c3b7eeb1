//! Webhook intake: translate one accepted external event into exactly one
//! queue-entry insert or one validation-response call, at-most-once per
//! external event ID within the dedup window.
//!
//! Signature verification happens in the surrounding HTTP collaborator; by
//! the time an event reaches [`process_event`] it is authenticated.

use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use conductor_db::models::Ticket;
use conductor_db::queries::{events as event_db, queue as queue_db, tickets as ticket_db};

use crate::error::OrchestratorError;
use crate::orchestrator::OrchestratorContext;
use crate::reactivation::{self, ReactivationDecision};
use crate::validation::ResponseDisposition;

/// An inbound external event, already signature-checked.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub source: String,
    pub event_id: String,
    pub event_type: String,
    pub payload: Value,
}

/// What the intake did with an event.
#[derive(Debug)]
pub enum IntakeOutcome {
    /// A queue entry was created for the item.
    Enqueued { entry_id: Uuid, ticket_id: Uuid },
    /// The event referenced a terminal ticket and went through the
    /// reactivation controller.
    Reactivation(ReactivationDecision),
    /// A validation response was recorded.
    ValidationRecorded(ResponseDisposition),
    /// The event ID was already seen inside the dedup window.
    Deduplicated,
    /// Enqueue was refused because the ticket is under cooldown.
    SkippedCooldown {
        until: chrono::DateTime<chrono::Utc>,
    },
    /// The event is missing required fields.
    Malformed(String),
}

impl IntakeOutcome {
    /// The outcome tag persisted to the event log.
    pub fn log_tag(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Reactivation(ReactivationDecision::Reactivated { .. }) => "reactivated",
            Self::Reactivation(ReactivationDecision::SkippedCooldown) => "skipped_cooldown",
            Self::Reactivation(ReactivationDecision::SkippedLocked) => "skipped_locked",
            Self::Reactivation(ReactivationDecision::DepthExceeded) => "skipped_depth",
            Self::Reactivation(ReactivationDecision::Ignored) => "ignored",
            Self::ValidationRecorded(_) => "validation_response",
            Self::Deduplicated => "deduplicated",
            Self::SkippedCooldown { .. } => "skipped_cooldown",
            Self::Malformed(_) => "rejected_malformed",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValidationResponsePayload {
    uuid: Uuid,
    status: conductor_db::models::ValidationDecision,
    #[serde(default)]
    comments: Option<String>,
    #[serde(default)]
    validator_id: Option<String>,
}

/// Process one inbound event end to end: dedup, route, and log.
pub async fn process_event(
    ctx: &Arc<OrchestratorContext>,
    event: &WebhookEvent,
) -> Result<IntakeOutcome> {
    if event.source.is_empty() || event.event_id.is_empty() || event.event_type.is_empty() {
        return Ok(IntakeOutcome::Malformed(
            "source, event_id, and event_type are required".to_owned(),
        ));
    }

    let now = ctx.clock.now();
    let first_sighting = event_db::try_record_event(&ctx.pool, &event.event_id, now).await?;
    if !first_sighting {
        log_event(ctx, event, "deduplicated").await;
        return Ok(IntakeOutcome::Deduplicated);
    }

    let outcome = route_event(ctx, event).await?;
    log_event(ctx, event, outcome.log_tag()).await;
    Ok(outcome)
}

async fn route_event(
    ctx: &Arc<OrchestratorContext>,
    event: &WebhookEvent,
) -> Result<IntakeOutcome> {
    if event.event_type == "validation_response" {
        return record_validation_response(ctx, &event.payload).await;
    }

    let Some(item_id) = event.payload.get("item_id").and_then(Value::as_str) else {
        return Ok(IntakeOutcome::Malformed(
            "payload.item_id is required".to_owned(),
        ));
    };

    let ticket = find_or_create_ticket(ctx, item_id, &event.payload).await?;
    let priority = event
        .payload
        .get("priority")
        .and_then(Value::as_i64)
        .unwrap_or(5)
        .clamp(1, 10) as i32;

    // A terminal ticket re-enters through the reactivation controller; a
    // live one goes straight onto its queue.
    if ticket.status.is_terminal() {
        let decision =
            reactivation::handle_terminal_ticket_event(ctx, &ticket, &event.payload, priority)
                .await?;
        return Ok(IntakeOutcome::Reactivation(decision));
    }

    if let Some(until) = ctx.cooldown.embargo_until(&ticket) {
        info!(ticket_id = %ticket.id, until = %until, "enqueue refused: cooling down");
        return Ok(IntakeOutcome::SkippedCooldown { until });
    }

    let entry = queue_db::enqueue(
        &ctx.pool,
        item_id,
        &event.payload,
        priority,
        false,
        ctx.clock.now(),
    )
    .await?;

    info!(
        entry_id = %entry.id,
        item_id = item_id,
        priority = priority,
        "event enqueued"
    );
    Ok(IntakeOutcome::Enqueued {
        entry_id: entry.id,
        ticket_id: ticket.id,
    })
}

/// Record a validation response arriving through the webhook channel (the
/// dedicated HTTP endpoint funnels into the same rendezvous call).
///
/// `changes_requested` immediately re-enters the pipeline: the controller
/// spawns the child run whose input carries the validator's comments.
pub async fn record_validation_response(
    ctx: &Arc<OrchestratorContext>,
    payload: &Value,
) -> Result<IntakeOutcome> {
    let parsed: ValidationResponsePayload = match serde_json::from_value(payload.clone()) {
        Ok(parsed) => parsed,
        Err(err) => return Ok(IntakeOutcome::Malformed(format!("bad response payload: {err}"))),
    };

    let disposition = ctx
        .rendezvous()
        .record_response(
            parsed.uuid,
            parsed.status,
            parsed.comments.as_deref(),
            parsed.validator_id.as_deref().unwrap_or("unknown"),
        )
        .await?;

    if let ResponseDisposition::ChangesRequested {
        ticket_id,
        ref comments,
        ..
    } = disposition
    {
        let ticket = ticket_db::get_ticket(&ctx.pool, ticket_id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                entity: "ticket",
                id: ticket_id,
            })?;
        let reactivation_payload = serde_json::json!({
            "classification": "reopen_with_new_requirement",
            "origin": "changes_requested",
            "comments": comments,
        });
        let decision =
            reactivation::handle_terminal_ticket_event(ctx, &ticket, &reactivation_payload, 5)
                .await?;
        info!(ticket_id = %ticket_id, decision = ?decision, "changes_requested follow-up");
    }

    Ok(IntakeOutcome::ValidationRecorded(disposition))
}

async fn find_or_create_ticket(
    ctx: &Arc<OrchestratorContext>,
    item_id: &str,
    payload: &Value,
) -> Result<Ticket> {
    if let Some(ticket) = ticket_db::get_ticket_by_external_id(&ctx.pool, item_id).await? {
        return Ok(ticket);
    }

    let title = payload
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or(item_id);
    let description = payload
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let repo = payload
        .get("repo")
        .or_else(|| payload.get("repository_url"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let ticket = ticket_db::insert_ticket(&ctx.pool, item_id, title, description, repo).await?;
    info!(ticket_id = %ticket.id, external_id = item_id, "ticket created");
    Ok(ticket)
}

async fn log_event(ctx: &Arc<OrchestratorContext>, event: &WebhookEvent, outcome: &str) {
    if let Err(err) = event_db::log_webhook_event(
        &ctx.pool,
        &event.event_id,
        &event.source,
        &event.event_type,
        &event.payload,
        outcome,
        ctx.clock.now(),
    )
    .await
    {
        tracing::warn!(event_id = %event.event_id, error = %err, "failed to log webhook event");
    }
}
