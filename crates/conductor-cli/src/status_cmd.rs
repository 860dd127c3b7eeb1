//! `conductor status`: show ticket progress and per-run step status.

use anyhow::Result;
use sqlx::PgPool;

use conductor_db::queries::{runs as run_db, steps as step_db, tickets as ticket_db};

use crate::resolve::resolve_ticket;

/// Run the status command.
///
/// When `ident` is `Some`, shows detailed status for that ticket. When
/// `None`, lists all tickets with a summary line.
pub async fn run_status(pool: &PgPool, ident: Option<&str>) -> Result<()> {
    match ident {
        Some(ident) => run_ticket_status(pool, ident).await,
        None => run_fleet_status(pool).await,
    }
}

/// Show detailed status for a single ticket.
async fn run_ticket_status(pool: &PgPool, ident: &str) -> Result<()> {
    let ticket = resolve_ticket(pool, ident)
        .await?
        .ok_or_else(|| anyhow::anyhow!("ticket {ident} not found"))?;

    println!("Ticket: {} ({})", ticket.external_id, ticket.id);
    println!("Title: {}", ticket.title);
    println!("Status: {}", ticket.status);
    if let Some(prev) = ticket.previous_status {
        println!("Previous status: {prev}");
    }
    if ticket.is_locked {
        println!(
            "Locked by: {} since {}",
            ticket.locked_by.as_deref().unwrap_or("?"),
            ticket
                .locked_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_default()
        );
    }
    if let Some(until) = ticket.cooldown_until {
        println!(
            "Cooldown until: {} (failed attempts: {})",
            until.format("%Y-%m-%d %H:%M:%S UTC"),
            ticket.failed_reactivation_attempts
        );
    }
    println!();

    let runs = run_db::list_runs_for_ticket(pool, ticket.id).await?;
    if runs.is_empty() {
        println!("No runs.");
        return Ok(());
    }

    for run in &runs {
        let reactivation = if run.is_reactivation {
            format!(" reactivation depth={}", run.reactivation_depth)
        } else {
            String::new()
        };
        println!(
            "Run #{} ({}) {} {}%{}",
            run.run_number, run.id, run.status, run.progress_percentage, reactivation
        );
        if let Some(reason) = &run.failure_reason {
            println!("  reason: {reason}");
        }

        let steps = step_db::list_steps_for_run(pool, run.id).await?;
        for step in &steps {
            let status_icon = match step.status.to_string().as_str() {
                "pending" => ".",
                "running" => "*",
                "completed" => "+",
                "failed" => "!",
                "skipped" => "-",
                _ => " ",
            };
            let retries = if step.retry_count > 0 {
                format!(" (retries {})", step.retry_count)
            } else {
                String::new()
            };
            println!(
                "  [{}] {:>2}. {}{}",
                status_icon, step.step_order, step.step_name, retries
            );
        }
    }

    Ok(())
}

/// List all tickets with a one-line summary.
async fn run_fleet_status(pool: &PgPool) -> Result<()> {
    let tickets = ticket_db::list_tickets(pool).await?;

    if tickets.is_empty() {
        println!("No tickets found.");
        return Ok(());
    }

    println!(
        "{:<24} {:<20} {:>6} {:>8} {:>10}",
        "EXTERNAL ID", "STATUS", "RUNS", "LOCKED", "REACTIVATIONS"
    );
    println!("{}", "-".repeat(74));

    for ticket in &tickets {
        let runs = run_db::list_runs_for_ticket(pool, ticket.id).await?;
        let id_display = if ticket.external_id.len() > 22 {
            format!("{}...", &ticket.external_id[..19])
        } else {
            ticket.external_id.clone()
        };
        println!(
            "{:<24} {:<20} {:>6} {:>8} {:>10}",
            id_display,
            ticket.status.to_string(),
            runs.len(),
            if ticket.is_locked { "yes" } else { "no" },
            ticket.reactivation_count,
        );
    }

    Ok(())
}
