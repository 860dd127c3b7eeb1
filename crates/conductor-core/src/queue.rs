//! The dispatcher: pulls per-item queue heads, binds engine workers behind a
//! concurrency limit, and re-binds runs woken from suspension or abandoned
//! by a crash.
//!
//! A single dispatcher task runs per orchestrator node (horizontal scaling
//! is by sharding ticket IDs across nodes, not by replicating the
//! scheduler); the claim query still uses `FOR UPDATE SKIP LOCKED` so a
//! second node pointed at the same shard cannot double-claim.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use conductor_db::models::QueueEntry;
use conductor_db::queries::{queue as queue_db, runs as run_db};

use crate::engine::recovery::{self, ResumableRun};
use crate::engine::{DriveOutcome, RunEngine};
use crate::orchestrator::OrchestratorContext;
use crate::retry::{with_infra_retry, CircuitBreaker};

/// Consecutive infra-failure streak that is fatal to the process.
const CIRCUIT_BREAKER_THRESHOLD: u32 = 10;

/// Message sent from worker tasks back to the dispatcher loop.
struct WorkerDone {
    entry_id: Uuid,
    item_id: String,
    outcome: Result<DriveOutcome>,
}

/// The dispatcher loop. One instance per `conductor serve`.
pub struct Dispatcher {
    ctx: Arc<OrchestratorContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<OrchestratorContext>) -> Self {
        Self { ctx }
    }

    /// Run until `shutdown` fires, then drain in-flight workers.
    ///
    /// Infrastructure errors re-enter through the jittered retry helper; a
    /// sustained streak trips the circuit breaker and returns the error as
    /// process-level fatal.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.ctx.settings.max_workers));
        let (tx, mut rx) = mpsc::channel::<WorkerDone>(self.ctx.settings.max_workers * 2);
        let mut in_flight: usize = 0;
        let breaker = CircuitBreaker::new(CIRCUIT_BREAKER_THRESHOLD);

        info!(
            max_workers = self.ctx.settings.max_workers,
            "dispatcher started"
        );

        loop {
            if shutdown.is_cancelled() {
                self.drain(&mut rx, &mut in_flight).await;
                info!("dispatcher stopped");
                return Ok(());
            }

            // Drain completed workers (non-blocking).
            while let Ok(done) = rx.try_recv() {
                in_flight -= 1;
                log_worker_done(&done);
            }

            let mut made_progress = false;

            // Re-bind runs woken from validation or abandoned by a crash.
            match with_infra_retry("resume_scan", async || recovery::scan(&self.ctx).await).await {
                Ok(resumable) => {
                    breaker.succeed();
                    for resume in resumable {
                        if self
                            .spawn_resume(resume, &semaphore, &tx, &shutdown)
                            .await?
                        {
                            in_flight += 1;
                            made_progress = true;
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "resume scan failed");
                    if breaker.fail() {
                        return Err(err.context("dispatcher circuit breaker tripped"));
                    }
                }
            }

            // Claim a fresh queue head, but only when a worker slot is free
            // so a claimed entry never sits waiting for a permit.
            if let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() {
                let now = self.ctx.clock.now();
                let timeout_at = now + chrono::Duration::from_std(self.ctx.settings.queue_timeout)
                    .unwrap_or_else(|_| chrono::Duration::hours(2));

                let claimed = with_infra_retry("queue_claim", async || {
                    queue_db::claim_next(&self.ctx.pool, now, timeout_at).await
                })
                .await;

                match claimed {
                    Ok(Some(entry)) => {
                        breaker.succeed();
                        self.spawn_worker(entry, permit, &tx, &shutdown).await?;
                        in_flight += 1;
                        made_progress = true;
                    }
                    Ok(None) => {
                        breaker.succeed();
                        drop(permit);
                    }
                    Err(err) => {
                        error!(error = %err, "queue claim failed");
                        drop(permit);
                        if breaker.fail() {
                            return Err(err.context("dispatcher circuit breaker tripped"));
                        }
                    }
                }
            }

            if !made_progress {
                // Idle: wait for a completion (which frees an item for its
                // next entry), a shutdown, or a short poll tick.
                if in_flight > 0 {
                    tokio::select! {
                        done = rx.recv() => {
                            if let Some(done) = done {
                                in_flight -= 1;
                                log_worker_done(&done);
                            }
                        }
                        _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                        _ = shutdown.cancelled() => continue,
                    }
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                        _ = shutdown.cancelled() => continue,
                    }
                }
            }
        }
    }

    /// Dispatch a freshly claimed entry to a worker.
    async fn spawn_worker(
        &self,
        mut entry: QueueEntry,
        permit: tokio::sync::OwnedSemaphorePermit,
        tx: &mpsc::Sender<WorkerDone>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let handle = self.ctx.broker.dispatch(&entry).await?;
        queue_db::set_dispatch_handle(&self.ctx.pool, entry.id, &handle).await?;
        entry.dispatch_handle = Some(handle);

        let ctx = Arc::clone(&self.ctx);
        let tx = tx.clone();
        let cancel = shutdown.child_token();
        let entry_id = entry.id;
        let item_id = entry.item_id.clone();

        tokio::spawn(async move {
            let engine = RunEngine::new(ctx);
            let outcome = engine.execute_entry(entry, cancel).await;
            drop(permit);
            let _ = tx
                .send(WorkerDone {
                    entry_id,
                    item_id,
                    outcome,
                })
                .await;
        });

        Ok(())
    }

    /// Re-bind a worker to a resumable run. Returns whether a worker was
    /// actually spawned.
    async fn spawn_resume(
        &self,
        resume: ResumableRun,
        semaphore: &Arc<Semaphore>,
        tx: &mpsc::Sender<WorkerDone>,
        shutdown: &CancellationToken,
    ) -> Result<bool> {
        let Some(mut entry) = queue_db::bound_entry_for_item(&self.ctx.pool, &resume.item_id).await?
        else {
            warn!(run_id = %resume.run.id, item_id = %resume.item_id, "resumable run has no bound entry");
            return Ok(false);
        };

        let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
            // No slot free; the next loop iteration will find the run again.
            return Ok(false);
        };

        let handle = self.ctx.broker.dispatch(&entry).await?;
        queue_db::set_dispatch_handle(&self.ctx.pool, entry.id, &handle).await?;
        run_db::set_dispatch_handle(&self.ctx.pool, resume.run.id, &handle).await?;
        entry.dispatch_handle = Some(handle);

        info!(run_id = %resume.run.id, entry_id = %entry.id, "re-binding worker to run");

        let ctx = Arc::clone(&self.ctx);
        let tx = tx.clone();
        let cancel = shutdown.child_token();
        let entry_id = entry.id;
        let item_id = entry.item_id.clone();

        tokio::spawn(async move {
            let engine = RunEngine::new(ctx);
            let outcome = engine.execute_entry(entry, cancel).await;
            drop(permit);
            let _ = tx
                .send(WorkerDone {
                    entry_id,
                    item_id,
                    outcome,
                })
                .await;
        });

        Ok(true)
    }

    /// Bounded wait for in-flight workers on shutdown.
    async fn drain(&self, rx: &mut mpsc::Receiver<WorkerDone>, in_flight: &mut usize) {
        if *in_flight == 0 {
            return;
        }
        info!(in_flight = *in_flight, "draining in-flight workers");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while *in_flight > 0 {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(done)) => {
                    *in_flight -= 1;
                    log_worker_done(&done);
                }
                _ => break,
            }
        }
        if *in_flight > 0 {
            warn!(
                remaining = *in_flight,
                "drain timeout expired with workers still in flight"
            );
        }
    }
}

fn log_worker_done(done: &WorkerDone) {
    match &done.outcome {
        Ok(outcome) => info!(
            entry_id = %done.entry_id,
            item_id = %done.item_id,
            outcome = ?outcome,
            "worker finished"
        ),
        Err(err) => error!(
            entry_id = %done.entry_id,
            item_id = %done.item_id,
            error = %err,
            "worker failed"
        ),
    }
}
