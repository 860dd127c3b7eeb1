//! `conductor sweep`: force one sweeper pass from the CLI.

use std::sync::Arc;

use anyhow::Result;

use conductor_core::orchestrator::OrchestratorContext;
use conductor_core::sweeper::Sweeper;

/// Run one sweep. `locks_only` restricts it to the stale-lock sweep.
pub async fn run_sweep(ctx: &Arc<OrchestratorContext>, locks_only: bool) -> Result<()> {
    let sweeper = Sweeper::new(Arc::clone(ctx));

    if locks_only {
        let released = sweeper.sweep_locks().await?;
        println!("Force-released {released} stale lock(s).");
        return Ok(());
    }

    let report = sweeper.sweep_once().await?;
    println!("Sweep complete:");
    println!("  stale locks released:   {}", report.locks_released);
    println!("  validations expired:    {}", report.validations_expired);
    println!("  queue entries timed out:{}", report.entries_timed_out);
    println!("  dedup rows pruned:      {}", report.dedup_pruned);
    println!("  cancels signalled:      {}", report.cancels_signalled);
    Ok(())
}
