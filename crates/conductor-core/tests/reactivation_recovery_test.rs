//! Reactivation-controller and crash-recovery integration tests.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use conductor_core::broker::LocalBroker;
use conductor_core::clock::ManualClock;
use conductor_core::engine::{recovery, DriveOutcome, RunEngine};
use conductor_core::error::{as_orchestrator_error, reasons, OrchestratorError};
use conductor_core::handler::{self, HandlerRegistry, StepContext, StepHandler, StepOutcome};
use conductor_core::notify::test_support::RecordingNotifier;
use conductor_core::orchestrator::{OrchestratorContext, Settings};
use conductor_core::reactivation::{self, PayloadClassifier, ReactivationDecision};

use conductor_db::models::{
    ReactivationAction, RunStatus, StepName, StepStatus, TicketStatus,
};
use conductor_db::queries::{
    queue as queue_db, reactivations as trigger_db, runs as run_db, steps as step_db,
    tickets as ticket_db,
};

use conductor_test_utils::{create_test_db, drop_test_db};

async fn harness_with(
    handlers: HandlerRegistry,
) -> (Arc<OrchestratorContext>, Arc<ManualClock>, String) {
    let (pool, db_name) = create_test_db().await;
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let ctx = OrchestratorContext::new(
        pool.clone(),
        handlers,
        Arc::new(LocalBroker::new(pool)),
        Arc::new(RecordingNotifier::default()),
        Arc::clone(&clock) as Arc<dyn conductor_core::clock::Clock>,
        Arc::new(PayloadClassifier),
        Settings::for_tests(),
    )
    .await
    .expect("context should build");
    (ctx, clock, db_name)
}

async fn harness() -> (Arc<OrchestratorContext>, Arc<ManualClock>, String) {
    harness_with(handler::passthrough_defaults()).await
}

/// A ticket whose single run already failed (terminal, reactivatable).
async fn failed_ticket(
    ctx: &Arc<OrchestratorContext>,
    external_id: &str,
) -> conductor_db::models::Ticket {
    let ticket = ticket_db::insert_ticket(&ctx.pool, external_id, "t", "", "git://x/y")
        .await
        .unwrap();
    let run = run_db::insert_run(&ctx.pool, ticket.id, false, None, 0).await.unwrap();
    sqlx::query(
        "UPDATE runs SET status = 'failed', started_at = NOW(), completed_at = NOW(), \
         failure_reason = 'step_retries_exhausted' WHERE id = $1",
    )
    .bind(run.id)
    .execute(&ctx.pool)
    .await
    .unwrap();
    sqlx::query("UPDATE tickets SET status = 'failed', last_run_id = $2 WHERE id = $1")
        .bind(ticket.id)
        .bind(run.id)
        .execute(&ctx.pool)
        .await
        .unwrap();
    ticket_db::get_ticket(&ctx.pool, ticket.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn reactivation_spawns_a_linked_child_run() {
    let (ctx, _clock, db_name) = harness().await;
    let ticket = failed_ticket(&ctx, "RA-1").await;
    let parent_id = ticket.last_run_id.unwrap();

    let decision = reactivation::handle_terminal_ticket_event(
        &ctx,
        &ticket,
        &json!({"comments": "also handle CSV"}),
        5,
    )
    .await
    .unwrap();
    let ReactivationDecision::Reactivated { run_id } = decision else {
        panic!("expected Reactivated, got {decision:?}");
    };

    let child = run_db::get_run(&ctx.pool, run_id).await.unwrap().unwrap();
    assert!(child.is_reactivation);
    assert_eq!(child.parent_run_id, Some(parent_id));
    assert_eq!(child.reactivation_depth, 1);
    assert_eq!(child.run_number, 2);

    let ticket = ticket_db::get_ticket(&ctx.pool, ticket.id).await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Processing);
    assert_eq!(ticket.previous_status, Some(TicketStatus::Failed));
    assert_eq!(ticket.reactivation_count, 1);
    assert!(!ticket.is_locked, "controller releases the lock after enqueue");

    let entries = queue_db::list_entries_for_item(&ctx.pool, "RA-1").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_reactivation);

    let triggers = trigger_db::list_triggers_for_ticket(&ctx.pool, ticket.id)
        .await
        .unwrap();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].action, ReactivationAction::Reactivated);
    assert_eq!(triggers[0].run_id, Some(run_id));

    // The engine picks the child up and starts at analyze (no prepare).
    let outcome = {
        let now = ctx.clock.now();
        let entry = queue_db::claim_next(&ctx.pool, now, now + chrono::Duration::hours(2))
            .await
            .unwrap()
            .unwrap();
        let handle = ctx.broker.dispatch(&entry).await.unwrap();
        queue_db::set_dispatch_handle(&ctx.pool, entry.id, &handle).await.unwrap();
        let entry = queue_db::get_entry(&ctx.pool, entry.id).await.unwrap().unwrap();
        RunEngine::new(Arc::clone(&ctx))
            .execute_entry(entry, CancellationToken::new())
            .await
            .unwrap()
    };
    assert_eq!(outcome, DriveOutcome::Suspended);

    let steps = step_db::list_steps_for_run(&ctx.pool, run_id).await.unwrap();
    assert_eq!(steps.len(), 8);
    assert_eq!(steps[0].step_name, StepName::Analyze);
    assert_eq!(steps[0].step_order, 1);

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cooldown_suppresses_reactivation() {
    let (ctx, _clock, db_name) = harness().await;
    let ticket = failed_ticket(&ctx, "RA-2").await;

    ticket_db::enter_cooldown(&ctx.pool, ticket.id, ctx.clock.now(), 60.0, 1800.0)
        .await
        .unwrap();
    let ticket = ticket_db::get_ticket(&ctx.pool, ticket.id).await.unwrap().unwrap();

    let decision = reactivation::handle_terminal_ticket_event(&ctx, &ticket, &json!({}), 5)
        .await
        .unwrap();
    assert_eq!(decision, ReactivationDecision::SkippedCooldown);

    let triggers = trigger_db::list_triggers_for_ticket(&ctx.pool, ticket.id)
        .await
        .unwrap();
    assert_eq!(triggers[0].action, ReactivationAction::SkippedCooldown);
    assert!(
        run_db::list_runs_for_ticket(&ctx.pool, ticket.id).await.unwrap().len() == 1,
        "no child run under cooldown"
    );

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn held_lock_skips_reactivation() {
    let (ctx, _clock, db_name) = harness().await;
    let ticket = failed_ticket(&ctx, "RA-3").await;

    let now = ctx.clock.now();
    ticket_db::try_acquire_lock(
        &ctx.pool,
        ticket.id,
        "another-node",
        now,
        now - chrono::Duration::minutes(30),
    )
    .await
    .unwrap();

    let decision = reactivation::handle_terminal_ticket_event(&ctx, &ticket, &json!({}), 5)
        .await
        .unwrap();
    assert_eq!(decision, ReactivationDecision::SkippedLocked);

    let triggers = trigger_db::list_triggers_for_ticket(&ctx.pool, ticket.id)
        .await
        .unwrap();
    assert_eq!(triggers[0].action, ReactivationAction::SkippedLocked);

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn depth_cap_is_enforced() {
    let (ctx, _clock, db_name) = harness().await;
    let ticket = failed_ticket(&ctx, "RA-4").await;
    let parent_id = ticket.last_run_id.unwrap();

    // Pin the parent at the cap.
    sqlx::query("UPDATE runs SET reactivation_depth = $2 WHERE id = $1")
        .bind(parent_id)
        .bind(ctx.settings.max_reactivation_depth)
        .execute(&ctx.pool)
        .await
        .unwrap();

    let err = reactivation::handle_terminal_ticket_event(&ctx, &ticket, &json!({}), 5)
        .await
        .expect_err("depth cap must fail the trigger");
    assert!(matches!(
        as_orchestrator_error(&err),
        Some(OrchestratorError::ReactivationDepthExceeded { .. })
    ));

    let triggers = trigger_db::list_triggers_for_ticket(&ctx.pool, ticket.id)
        .await
        .unwrap();
    assert_eq!(triggers[0].action, ReactivationAction::SkippedDepth);

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn chain_walk_is_newest_first_and_bounded() {
    let (ctx, _clock, db_name) = harness().await;
    let ticket = failed_ticket(&ctx, "RA-5").await;
    let r1 = ticket.last_run_id.unwrap();

    let r2 = run_db::insert_run(&ctx.pool, ticket.id, true, Some(r1), 1).await.unwrap();
    sqlx::query("UPDATE runs SET status = 'failed', started_at = NOW(), completed_at = NOW() WHERE id = $1")
        .bind(r2.id)
        .execute(&ctx.pool)
        .await
        .unwrap();
    let r3 = run_db::insert_run(&ctx.pool, ticket.id, true, Some(r2.id), 2)
        .await
        .unwrap();

    let chain = reactivation::reactivation_chain(&ctx, ticket.id).await.unwrap();
    let ids: Vec<_> = chain.iter().map(|n| n.run.id).collect();
    assert_eq!(ids, vec![r3.id, r2.id, r1]);
    assert_eq!(chain[0].depth_from_leaf, 0);
    assert_eq!(chain[2].depth_from_leaf, 2);

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn failed_reactivation_run_sets_cooldown() {
    let mut handlers = handler::passthrough_defaults();

    struct AlwaysFail;
    #[async_trait::async_trait]
    impl StepHandler for AlwaysFail {
        fn step(&self) -> StepName {
            StepName::Analyze
        }
        async fn handle(
            &self,
            _ctx: &StepContext,
            _input: Option<serde_json::Value>,
            _checkpoint: Option<serde_json::Value>,
        ) -> anyhow::Result<StepOutcome> {
            Ok(StepOutcome::Fail {
                reason: "analysis_refused".into(),
                retryable: false,
            })
        }
    }
    handlers.register(AlwaysFail);

    let (ctx, _clock, db_name) = harness_with(handlers).await;
    let ticket = failed_ticket(&ctx, "RA-6").await;

    let decision = reactivation::handle_terminal_ticket_event(&ctx, &ticket, &json!({}), 5)
        .await
        .unwrap();
    assert!(matches!(decision, ReactivationDecision::Reactivated { .. }));

    let now = ctx.clock.now();
    let entry = queue_db::claim_next(&ctx.pool, now, now + chrono::Duration::hours(2))
        .await
        .unwrap()
        .unwrap();
    let handle = ctx.broker.dispatch(&entry).await.unwrap();
    queue_db::set_dispatch_handle(&ctx.pool, entry.id, &handle).await.unwrap();
    let entry = queue_db::get_entry(&ctx.pool, entry.id).await.unwrap().unwrap();
    let outcome = RunEngine::new(Arc::clone(&ctx))
        .execute_entry(entry, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, DriveOutcome::Failed("analysis_refused".into()));

    let ticket = ticket_db::get_ticket(&ctx.pool, ticket.id).await.unwrap().unwrap();
    assert_eq!(ticket.failed_reactivation_attempts, 1);
    let until = ticket.cooldown_until.expect("cooldown set after failed reactivation");
    assert_eq!((until - ctx.clock.now()).num_seconds(), 60);

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

// ---------------------------------------------------------------------------
// Crash recovery
// ---------------------------------------------------------------------------

/// Simulate a crash: claim and bind a run mid-step, then drop the broker's
/// liveness for the handle.
async fn crashed_mid_step(
    ctx: &Arc<OrchestratorContext>,
    external_id: &str,
    step_name: StepName,
) -> conductor_db::models::Run {
    let ticket = ticket_db::insert_ticket(&ctx.pool, external_id, "t", "", "git://x/y")
        .await
        .unwrap();
    let entry = queue_db::enqueue(&ctx.pool, external_id, &json!({}), 5, false, ctx.clock.now())
        .await
        .unwrap();

    let now = ctx.clock.now();
    let claimed = queue_db::claim_next(&ctx.pool, now, now + chrono::Duration::hours(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, entry.id);
    let handle = ctx.broker.dispatch(&claimed).await.unwrap();
    queue_db::set_dispatch_handle(&ctx.pool, entry.id, &handle).await.unwrap();

    let run = run_db::insert_run(&ctx.pool, ticket.id, false, None, 0).await.unwrap();
    step_db::insert_steps(&ctx.pool, run.id, &conductor_db::models::CANONICAL_STEPS, 3)
        .await
        .unwrap();
    run_db::set_dispatch_handle(&ctx.pool, run.id, &handle).await.unwrap();
    sqlx::query("UPDATE runs SET status = 'running', started_at = NOW() WHERE id = $1")
        .bind(run.id)
        .execute(&ctx.pool)
        .await
        .unwrap();

    // Mark every step before `step_name` completed and `step_name` running.
    let steps = step_db::list_steps_for_run(&ctx.pool, run.id).await.unwrap();
    for step in &steps {
        if step.step_name == step_name {
            sqlx::query("UPDATE run_steps SET status = 'running', started_at = NOW() WHERE id = $1")
                .bind(step.id)
                .execute(&ctx.pool)
                .await
                .unwrap();
            step_db::insert_checkpoint(&ctx.pool, step.id, &json!({"cursor": 42}))
                .await
                .unwrap();
            break;
        }
        sqlx::query(
            "UPDATE run_steps SET status = 'completed', started_at = NOW(), \
             completed_at = NOW(), output_data = '{}'::jsonb WHERE id = $1",
        )
        .bind(step.id)
        .execute(&ctx.pool)
        .await
        .unwrap();
    }

    // The "crash": the broker no longer considers the handle live.
    ctx.broker.complete(&handle).await.unwrap();

    run_db::get_run(&ctx.pool, run.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn resumable_mid_step_run_is_reset_for_re_dispatch() {
    let (ctx, _clock, db_name) = harness().await;
    let run = crashed_mid_step(&ctx, "RC-1", StepName::Implement).await;

    let resumable = recovery::scan(&ctx).await.unwrap();
    assert_eq!(resumable.len(), 1);
    assert_eq!(resumable[0].run.id, run.id);

    let steps = step_db::list_steps_for_run(&ctx.pool, run.id).await.unwrap();
    let implement = steps
        .iter()
        .find(|s| s.step_name == StepName::Implement)
        .unwrap();
    assert_eq!(implement.status, StepStatus::Pending, "reset for re-dispatch");
    assert_eq!(implement.retry_count, 0, "a restart is not a retry");

    // The checkpoint survives and rides along on the next dispatch.
    let cp = step_db::latest_checkpoint(&ctx.pool, implement.id)
        .await
        .unwrap()
        .expect("checkpoint kept");
    assert_eq!(cp.checkpoint_data["cursor"], 42);

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn non_resumable_mid_step_run_fails_as_orphan() {
    struct FragileHandler;
    #[async_trait::async_trait]
    impl StepHandler for FragileHandler {
        fn step(&self) -> StepName {
            StepName::Implement
        }
        async fn handle(
            &self,
            _ctx: &StepContext,
            _input: Option<serde_json::Value>,
            _checkpoint: Option<serde_json::Value>,
        ) -> anyhow::Result<StepOutcome> {
            Ok(StepOutcome::Completed(serde_json::json!({})))
        }
        // Cannot be safely re-run after a crash.
        fn resumable(&self) -> bool {
            false
        }
    }

    let mut handlers = handler::passthrough_defaults();
    handlers.register(FragileHandler);
    let (ctx, _clock, db_name) = harness_with(handlers).await;
    let run = crashed_mid_step(&ctx, "RC-2", StepName::Implement).await;

    let resumable = recovery::scan(&ctx).await.unwrap();
    assert!(resumable.is_empty(), "nothing to resume");

    let run = run_db::get_run(&ctx.pool, run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_reason.as_deref(), Some(reasons::ORPHAN_ON_RESTART));

    let ticket = ticket_db::get_ticket(&ctx.pool, run.ticket_id).await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Failed);

    let entries = queue_db::list_entries_for_item(&ctx.pool, "RC-2").await.unwrap();
    assert_eq!(entries[0].status, conductor_db::models::QueueStatus::Failed);

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn recovery_does_not_reinvoke_completed_steps() {
    // Crash during `test`; prepare..implement are completed. On resume, the
    // engine must advance using persisted outputs without re-invoking the
    // completed steps' handlers.
    let counted = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    struct CountingHandler {
        for_step: StepName,
        count: Arc<std::sync::atomic::AtomicUsize>,
    }
    #[async_trait::async_trait]
    impl StepHandler for CountingHandler {
        fn step(&self) -> StepName {
            self.for_step
        }
        async fn handle(
            &self,
            _ctx: &StepContext,
            _input: Option<serde_json::Value>,
            _checkpoint: Option<serde_json::Value>,
        ) -> anyhow::Result<StepOutcome> {
            self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(StepOutcome::Completed(serde_json::json!({})))
        }
        fn resumable(&self) -> bool {
            true
        }
    }

    let mut handlers = handler::passthrough_defaults();
    handlers.register(CountingHandler {
        for_step: StepName::Implement,
        count: Arc::clone(&counted),
    });
    let (ctx, _clock, db_name) = harness_with(handlers).await;

    let run = crashed_mid_step(&ctx, "RC-3", StepName::Test).await;

    let resumable = recovery::scan(&ctx).await.unwrap();
    assert_eq!(resumable.len(), 1);

    // Re-bind and finish to suspension.
    let entry = queue_db::bound_entry_for_item(&ctx.pool, "RC-3").await.unwrap().unwrap();
    let handle = ctx.broker.dispatch(&entry).await.unwrap();
    queue_db::set_dispatch_handle(&ctx.pool, entry.id, &handle).await.unwrap();
    run_db::set_dispatch_handle(&ctx.pool, run.id, &handle).await.unwrap();
    let entry = queue_db::get_entry(&ctx.pool, entry.id).await.unwrap().unwrap();
    let outcome = RunEngine::new(Arc::clone(&ctx))
        .execute_entry(entry, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, DriveOutcome::Suspended);

    assert_eq!(
        counted.load(std::sync::atomic::Ordering::SeqCst),
        0,
        "implement completed before the crash; its handler must not run again"
    );

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}
