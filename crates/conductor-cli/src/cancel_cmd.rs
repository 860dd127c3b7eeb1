//! `conductor cancel`: cancel a ticket's active run and pending queue
//! entries.
//!
//! The CLI runs out-of-process from `conductor serve`, so an active run is
//! flagged `cancel_requested`; the serve process's cancel watchdog fires the
//! bound worker's token and enforces the grace window.

use anyhow::Result;
use sqlx::PgPool;

use conductor_core::error::reasons;
use conductor_db::queries::{queue as queue_db, runs as run_db};

use crate::resolve::resolve_ticket;

/// Exit code when the ticket has nothing active to cancel.
pub const EXIT_NONE_ACTIVE: i32 = 3;

/// Run the cancel command. Returns the process exit code.
pub async fn run_cancel(pool: &PgPool, ident: &str) -> Result<i32> {
    let Some(ticket) = resolve_ticket(pool, ident).await? else {
        eprintln!("ticket {ident} not found");
        return Ok(EXIT_NONE_ACTIVE);
    };

    let mut cancelled_anything = false;

    let pending = queue_db::cancel_pending_for_item(
        pool,
        &ticket.external_id,
        reasons::CANCELLED,
    )
    .await?;
    if !pending.is_empty() {
        println!("Cancelled {} pending queue entries.", pending.len());
        cancelled_anything = true;
    }

    if let Some(run) = run_db::active_run_for_ticket(pool, ticket.id).await? {
        run_db::request_cancel(pool, run.id).await?;
        println!(
            "Cancellation requested for run #{} ({}); the orchestrator will \
             stop it within the grace window.",
            run.run_number, run.id
        );
        cancelled_anything = true;
    }

    if !cancelled_anything {
        eprintln!("ticket {} has no active run or pending work", ticket.external_id);
        return Ok(EXIT_NONE_ACTIVE);
    }

    Ok(0)
}
