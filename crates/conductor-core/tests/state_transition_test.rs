//! Integration tests for the transition guard: registry legality,
//! optimistic-lock races, step ordering, and soft-delete classification.

use std::sync::Arc;

use chrono::Utc;

use conductor_core::broker::LocalBroker;
use conductor_core::clock::ManualClock;
use conductor_core::error::{as_orchestrator_error, OrchestratorError};
use conductor_core::handler;
use conductor_core::notify::test_support::RecordingNotifier;
use conductor_core::orchestrator::{OrchestratorContext, Settings};
use conductor_core::reactivation::PayloadClassifier;

use conductor_db::models::{RunStatus, StepStatus, TicketStatus, CANONICAL_STEPS};
use conductor_db::queries::{runs as run_db, steps as step_db, tickets as ticket_db};

use conductor_test_utils::{create_test_db, drop_test_db};

async fn harness() -> (Arc<OrchestratorContext>, String) {
    let (pool, db_name) = create_test_db().await;
    let ctx = OrchestratorContext::new(
        pool.clone(),
        handler::passthrough_defaults(),
        Arc::new(LocalBroker::new(pool)),
        Arc::new(RecordingNotifier::default()),
        Arc::new(ManualClock::new(Utc::now())),
        Arc::new(PayloadClassifier),
        Settings::for_tests(),
    )
    .await
    .expect("context should build");
    (ctx, db_name)
}

#[tokio::test]
async fn illegal_edge_is_rejected_before_any_write() {
    let (ctx, db_name) = harness().await;

    let ticket = ticket_db::insert_ticket(&ctx.pool, "TR-1", "t", "", "git://x/y")
        .await
        .unwrap();

    // pending -> completed skips the whole pipeline.
    let err = ctx
        .guard
        .ticket(
            &ctx.pool,
            ticket.id,
            TicketStatus::Pending,
            TicketStatus::Completed,
            "test",
            None,
        )
        .await
        .expect_err("illegal edge must fail");
    assert!(matches!(
        as_orchestrator_error(&err),
        Some(OrchestratorError::InvalidTransition { category: "task", .. })
    ));

    // Nothing was written.
    let t = ticket_db::get_ticket(&ctx.pool, ticket.id).await.unwrap().unwrap();
    assert_eq!(t.status, TicketStatus::Pending);

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn concurrent_transition_loses_exactly_once() {
    let (ctx, db_name) = harness().await;

    let ticket = ticket_db::insert_ticket(&ctx.pool, "TR-2", "t", "", "git://x/y")
        .await
        .unwrap();

    let a = {
        let ctx = Arc::clone(&ctx);
        let id = ticket.id;
        tokio::spawn(async move {
            ctx.guard
                .ticket(
                    &ctx.pool,
                    id,
                    TicketStatus::Pending,
                    TicketStatus::Processing,
                    "racer-a",
                    None,
                )
                .await
        })
    };
    let b = {
        let ctx = Arc::clone(&ctx);
        let id = ticket.id;
        tokio::spawn(async move {
            ctx.guard
                .ticket(
                    &ctx.pool,
                    id,
                    TicketStatus::Pending,
                    TicketStatus::Processing,
                    "racer-b",
                    None,
                )
                .await
        })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one racer should win");

    let loser = results.into_iter().find(|r| r.is_err()).unwrap().unwrap_err();
    assert!(matches!(
        as_orchestrator_error(&loser),
        Some(OrchestratorError::Conflict { entity: "ticket", .. })
    ));

    let t = ticket_db::get_ticket(&ctx.pool, ticket.id).await.unwrap().unwrap();
    assert_eq!(t.status, TicketStatus::Processing);

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn step_cannot_start_before_predecessors_finish() {
    let (ctx, db_name) = harness().await;

    let ticket = ticket_db::insert_ticket(&ctx.pool, "TR-3", "t", "", "git://x/y")
        .await
        .unwrap();
    let run = run_db::insert_run(&ctx.pool, ticket.id, false, None, 0).await.unwrap();
    let steps = step_db::insert_steps(&ctx.pool, run.id, &CANONICAL_STEPS, 3)
        .await
        .unwrap();

    // Step 2 (analyze) cannot run while step 1 (prepare) is pending.
    let err = ctx
        .guard
        .step(
            &ctx.pool,
            steps[1].id,
            StepStatus::Pending,
            StepStatus::Running,
            "test",
            None,
            Some(Utc::now()),
            None,
        )
        .await
        .expect_err("step 2 must be blocked");
    assert!(matches!(
        as_orchestrator_error(&err),
        Some(OrchestratorError::InvalidTransition { category: "step", .. })
    ));

    // Complete step 1; step 2 becomes startable.
    ctx.guard
        .step(
            &ctx.pool,
            steps[0].id,
            StepStatus::Pending,
            StepStatus::Running,
            "test",
            None,
            Some(Utc::now()),
            None,
        )
        .await
        .unwrap();
    ctx.guard
        .step(
            &ctx.pool,
            steps[0].id,
            StepStatus::Running,
            StepStatus::Completed,
            "test",
            None,
            None,
            Some(Utc::now()),
        )
        .await
        .unwrap();

    ctx.guard
        .step(
            &ctx.pool,
            steps[1].id,
            StepStatus::Pending,
            StepStatus::Running,
            "test",
            None,
            Some(Utc::now()),
            None,
        )
        .await
        .expect("step 2 should start after step 1 completed");

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn writes_against_soft_deleted_rows_surface_modify_deleted() {
    let (ctx, db_name) = harness().await;

    let ticket = ticket_db::insert_ticket(&ctx.pool, "TR-4", "t", "", "git://x/y")
        .await
        .unwrap();
    ticket_db::soft_delete_ticket(&ctx.pool, ticket.id).await.unwrap();

    let err = ctx
        .guard
        .ticket(
            &ctx.pool,
            ticket.id,
            TicketStatus::Pending,
            TicketStatus::Processing,
            "test",
            None,
        )
        .await
        .expect_err("write against deleted row must fail");
    assert!(matches!(
        as_orchestrator_error(&err),
        Some(OrchestratorError::ModifyDeleted { entity: "ticket", .. })
    ));

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn run_transitions_follow_the_registry() {
    let (ctx, db_name) = harness().await;

    let ticket = ticket_db::insert_ticket(&ctx.pool, "TR-5", "t", "", "git://x/y")
        .await
        .unwrap();
    let run = run_db::insert_run(&ctx.pool, ticket.id, false, None, 0).await.unwrap();

    // started -> waiting_validation skips running.
    let err = ctx
        .guard
        .run(
            &ctx.pool,
            run.id,
            RunStatus::Started,
            RunStatus::WaitingValidation,
            "test",
            None,
            None,
            None,
        )
        .await
        .expect_err("skip edge must be rejected");
    assert!(matches!(
        as_orchestrator_error(&err),
        Some(OrchestratorError::InvalidTransition { category: "run", .. })
    ));

    ctx.guard
        .run(
            &ctx.pool,
            run.id,
            RunStatus::Started,
            RunStatus::Running,
            "test",
            None,
            Some(Utc::now()),
            None,
        )
        .await
        .unwrap();

    let r = run_db::get_run(&ctx.pool, run.id).await.unwrap().unwrap();
    assert_eq!(r.status, RunStatus::Running);
    assert!(r.started_at.is_some());

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}
