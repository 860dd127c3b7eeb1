//! `conductor reactivations show`: render a ticket's reactivation tree and
//! its trigger audit trail.

use std::sync::Arc;

use anyhow::Result;

use conductor_core::orchestrator::OrchestratorContext;
use conductor_core::reactivation;
use conductor_db::queries::reactivations as trigger_db;

use crate::resolve::resolve_ticket;

/// Exit code when the ticket is unknown.
pub const EXIT_UNKNOWN_TICKET: i32 = 4;

/// Print the reactivation chain (newest run first, ancestors indented) and
/// the trigger rows. Returns the process exit code.
pub async fn run_show(ctx: &Arc<OrchestratorContext>, ident: &str) -> Result<i32> {
    let Some(ticket) = resolve_ticket(&ctx.pool, ident).await? else {
        eprintln!("ticket {ident} not found");
        return Ok(EXIT_UNKNOWN_TICKET);
    };

    println!(
        "Reactivation tree for {} ({}):",
        ticket.external_id, ticket.id
    );
    println!(
        "  reactivations: {}  failed attempts: {}",
        ticket.reactivation_count, ticket.failed_reactivation_attempts
    );
    println!();

    let chain = reactivation::reactivation_chain(ctx, ticket.id).await?;
    if chain.is_empty() {
        println!("No runs.");
    } else {
        for node in &chain {
            let indent = "  ".repeat(node.depth_from_leaf);
            let run = &node.run;
            let kind = if run.is_reactivation {
                "reactivation"
            } else {
                "initial"
            };
            let reason = run
                .failure_reason
                .as_deref()
                .map(|r| format!(" [{r}]"))
                .unwrap_or_default();
            println!(
                "{indent}run #{} ({kind}, depth {}) {} {}%{reason}",
                run.run_number, run.reactivation_depth, run.status, run.progress_percentage
            );
        }
    }

    let triggers = trigger_db::list_triggers_for_ticket(&ctx.pool, ticket.id).await?;
    if !triggers.is_empty() {
        println!();
        println!("Triggers:");
        for trigger in &triggers {
            let detail = trigger
                .detail
                .as_deref()
                .map(|d| format!(" -- {d}"))
                .unwrap_or_default();
            println!(
                "  {} {} -> {}{}",
                trigger.created_at.format("%Y-%m-%d %H:%M:%S"),
                trigger.classification,
                trigger.action,
                detail
            );
        }
    }

    Ok(0)
}
