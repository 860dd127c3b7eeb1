//! Run-engine integration tests: the step loop, retries, suspension, and
//! failure classification.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use conductor_core::broker::LocalBroker;
use conductor_core::clock::ManualClock;
use conductor_core::engine::{DriveOutcome, RunEngine};
use conductor_core::handler::{self, StepContext, StepHandler, StepOutcome};
use conductor_core::notify::test_support::RecordingNotifier;
use conductor_core::orchestrator::{OrchestratorContext, Settings};
use conductor_core::reactivation::PayloadClassifier;

use conductor_db::models::{QueueStatus, RunStatus, StepName, StepStatus, TicketStatus};
use conductor_db::queries::{queue as queue_db, runs as run_db, steps as step_db, tickets as ticket_db};

use conductor_test_utils::{create_test_db, drop_test_db};

/// A handler that plays back a scripted outcome sequence, then completes.
struct ScriptedHandler {
    for_step: StepName,
    script: Mutex<VecDeque<StepOutcome>>,
    invocations: Arc<AtomicUsize>,
}

impl ScriptedHandler {
    fn new(for_step: StepName, script: Vec<StepOutcome>) -> (Self, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        (
            Self {
                for_step,
                script: Mutex::new(script.into()),
                invocations: Arc::clone(&invocations),
            },
            invocations,
        )
    }
}

#[async_trait]
impl StepHandler for ScriptedHandler {
    fn step(&self) -> StepName {
        self.for_step
    }

    async fn handle(
        &self,
        _ctx: &StepContext,
        _input: Option<Value>,
        _checkpoint: Option<Value>,
    ) -> Result<StepOutcome> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or(StepOutcome::Completed(json!({"scripted": true}))))
    }

    fn resumable(&self) -> bool {
        true
    }
}

async fn harness_with(
    handlers: conductor_core::handler::HandlerRegistry,
) -> (Arc<OrchestratorContext>, Arc<RecordingNotifier>, String) {
    let (pool, db_name) = create_test_db().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = OrchestratorContext::new(
        pool.clone(),
        handlers,
        Arc::new(LocalBroker::new(pool)),
        Arc::clone(&notifier) as Arc<dyn conductor_core::notify::Notifier>,
        Arc::new(ManualClock::new(Utc::now())),
        Arc::new(PayloadClassifier),
        Settings::for_tests(),
    )
    .await
    .expect("context should build");
    (ctx, notifier, db_name)
}

async fn harness() -> (Arc<OrchestratorContext>, Arc<RecordingNotifier>, String) {
    harness_with(handler::passthrough_defaults()).await
}

/// Insert a ticket and enqueue one event for it.
async fn seed_ticket(ctx: &Arc<OrchestratorContext>, external_id: &str) {
    ticket_db::insert_ticket(&ctx.pool, external_id, "a ticket", "", "git://x/y")
        .await
        .unwrap();
    queue_db::enqueue(&ctx.pool, external_id, &json!({}), 5, false, ctx.clock.now())
        .await
        .unwrap();
}

/// Claim the next entry, bind a broker handle, and run the engine on it --
/// what one dispatcher worker does.
async fn claim_and_execute(ctx: &Arc<OrchestratorContext>) -> DriveOutcome {
    let now = ctx.clock.now();
    let entry = queue_db::claim_next(&ctx.pool, now, now + chrono::Duration::hours(2))
        .await
        .unwrap()
        .expect("an entry should be claimable");
    let handle = ctx.broker.dispatch(&entry).await.unwrap();
    queue_db::set_dispatch_handle(&ctx.pool, entry.id, &handle).await.unwrap();
    let entry = queue_db::get_entry(&ctx.pool, entry.id).await.unwrap().unwrap();

    RunEngine::new(Arc::clone(ctx))
        .execute_entry(entry, CancellationToken::new())
        .await
        .expect("engine should not error")
}

#[tokio::test]
async fn run_suspends_at_await_validation() {
    let (ctx, notifier, db_name) = harness().await;
    seed_ticket(&ctx, "E-1").await;

    let outcome = claim_and_execute(&ctx).await;
    assert_eq!(outcome, DriveOutcome::Suspended);

    let ticket = ticket_db::get_ticket_by_external_id(&ctx.pool, "E-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ticket.status, TicketStatus::AwaitingValidation);
    assert!(!ticket.is_locked, "lock is released while waiting for validation");

    let run = run_db::active_run_for_ticket(&ctx.pool, ticket.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::WaitingValidation);
    // Six of nine steps done before await_validation: floor(6/9*100) = 66.
    assert_eq!(run.progress_percentage, 66);

    let entry = queue_db::bound_entry_for_item(&ctx.pool, "E-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, QueueStatus::WaitingValidation);

    let pending = notifier.validations.lock().unwrap();
    assert_eq!(pending.len(), 1, "one validation notification");
    assert_eq!(pending[0].run_id, run.id);

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retryable_failures_requeue_with_attempt_counting() {
    let mut handlers = handler::passthrough_defaults();
    let (scripted, invocations) = ScriptedHandler::new(
        StepName::Implement,
        vec![
            StepOutcome::Retry {
                reason: "flaky model".into(),
            },
            StepOutcome::Retry {
                reason: "flaky model".into(),
            },
        ],
    );
    handlers.register(scripted);
    let (ctx, _notifier, db_name) = harness_with(handlers).await;
    seed_ticket(&ctx, "E-2").await;

    let outcome = claim_and_execute(&ctx).await;
    assert_eq!(outcome, DriveOutcome::Suspended, "run proceeds after retries");
    assert_eq!(invocations.load(Ordering::SeqCst), 3, "two retries + success");

    let ticket = ticket_db::get_ticket_by_external_id(&ctx.pool, "E-2")
        .await
        .unwrap()
        .unwrap();
    let run = run_db::active_run_for_ticket(&ctx.pool, ticket.id)
        .await
        .unwrap()
        .unwrap();
    let steps = step_db::list_steps_for_run(&ctx.pool, run.id).await.unwrap();
    let implement = steps
        .iter()
        .find(|s| s.step_name == StepName::Implement)
        .unwrap();
    assert_eq!(implement.retry_count, 2);
    assert_eq!(implement.status, StepStatus::Completed);

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn exhausted_retries_fail_the_run() {
    let mut handlers = handler::passthrough_defaults();
    let retry = || StepOutcome::Retry {
        reason: "still broken".into(),
    };
    let (scripted, _) =
        ScriptedHandler::new(StepName::Test, vec![retry(), retry(), retry(), retry()]);
    handlers.register(scripted);
    let (ctx, notifier, db_name) = harness_with(handlers).await;
    seed_ticket(&ctx, "E-3").await;

    let outcome = claim_and_execute(&ctx).await;
    let DriveOutcome::Failed(reason) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(
        reason.starts_with("step_retries_exhausted"),
        "unexpected reason: {reason}"
    );

    let ticket = ticket_db::get_ticket_by_external_id(&ctx.pool, "E-3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ticket.status, TicketStatus::Failed);

    let runs = run_db::list_runs_for_ticket(&ctx.pool, ticket.id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0].failure_reason.as_deref().unwrap().starts_with("step_retries_exhausted"));

    let entries = queue_db::list_entries_for_item(&ctx.pool, "E-3").await.unwrap();
    assert_eq!(entries[0].status, QueueStatus::Failed);

    let completions = notifier.completions.lock().unwrap();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].outcome, "failed");

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn non_retryable_failure_is_terminal_immediately() {
    let mut handlers = handler::passthrough_defaults();
    let (scripted, invocations) = ScriptedHandler::new(
        StepName::QualityCheck,
        vec![StepOutcome::Fail {
            reason: "lint_refused".into(),
            retryable: false,
        }],
    );
    handlers.register(scripted);
    let (ctx, _notifier, db_name) = harness_with(handlers).await;
    seed_ticket(&ctx, "E-4").await;

    let outcome = claim_and_execute(&ctx).await;
    assert_eq!(outcome, DriveOutcome::Failed("lint_refused".into()));
    assert_eq!(invocations.load(Ordering::SeqCst), 1, "no retry on non-retryable");

    let ticket = ticket_db::get_ticket_by_external_id(&ctx.pool, "E-4")
        .await
        .unwrap()
        .unwrap();
    let runs = run_db::list_runs_for_ticket(&ctx.pool, ticket.id).await.unwrap();
    let steps = step_db::list_steps_for_run(&ctx.pool, runs[0].id).await.unwrap();
    let qc = steps
        .iter()
        .find(|s| s.step_name == StepName::QualityCheck)
        .unwrap();
    assert_eq!(qc.status, StepStatus::Failed);
    assert_eq!(qc.retry_count, 0);

    // Later steps never started.
    let merge = steps.iter().find(|s| s.step_name == StepName::Merge).unwrap();
    assert_eq!(merge.status, StepStatus::Pending);

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn step_output_flows_into_next_step_input() {
    let (ctx, _notifier, db_name) = harness().await;
    seed_ticket(&ctx, "E-5").await;

    claim_and_execute(&ctx).await;

    let ticket = ticket_db::get_ticket_by_external_id(&ctx.pool, "E-5")
        .await
        .unwrap()
        .unwrap();
    let run = run_db::active_run_for_ticket(&ctx.pool, ticket.id)
        .await
        .unwrap()
        .unwrap();
    let steps = step_db::list_steps_for_run(&ctx.pool, run.id).await.unwrap();

    let analyze = steps.iter().find(|s| s.step_name == StepName::Analyze).unwrap();
    let input = analyze.input_data.as_ref().expect("analyze should have input");
    assert_eq!(input["step"], "prepare", "input is prepare's output");

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn progress_is_monotonic_across_the_run() {
    let (ctx, _notifier, db_name) = harness().await;
    seed_ticket(&ctx, "E-6").await;

    claim_and_execute(&ctx).await;

    let ticket = ticket_db::get_ticket_by_external_id(&ctx.pool, "E-6")
        .await
        .unwrap()
        .unwrap();
    let run = run_db::active_run_for_ticket(&ctx.pool, ticket.id)
        .await
        .unwrap()
        .unwrap();

    // A stale writer cannot move progress backwards.
    run_db::set_progress(&ctx.pool, run.id, 10).await.unwrap();
    let r = run_db::get_run(&ctx.pool, run.id).await.unwrap().unwrap();
    assert_eq!(r.progress_percentage, 66, "progress must not regress");

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_requested_between_steps_cancels_the_run() {
    // Script implement to flag the cancel, so the engine observes it before
    // the next step.
    struct CancelFlagger {
        pool: sqlx::PgPool,
    }

    #[async_trait]
    impl StepHandler for CancelFlagger {
        fn step(&self) -> StepName {
            StepName::Implement
        }

        async fn handle(
            &self,
            ctx: &StepContext,
            _input: Option<Value>,
            _checkpoint: Option<Value>,
        ) -> Result<StepOutcome> {
            run_db::request_cancel(&self.pool, ctx.run_id).await?;
            Ok(StepOutcome::Completed(json!({})))
        }
    }

    let (pool, db_name) = create_test_db().await;
    let mut handlers = handler::passthrough_defaults();
    handlers.register(CancelFlagger { pool: pool.clone() });

    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = OrchestratorContext::new(
        pool.clone(),
        handlers,
        Arc::new(LocalBroker::new(pool)),
        Arc::clone(&notifier) as Arc<dyn conductor_core::notify::Notifier>,
        Arc::new(ManualClock::new(Utc::now())),
        Arc::new(PayloadClassifier),
        Settings::for_tests(),
    )
    .await
    .unwrap();

    seed_ticket(&ctx, "E-7").await;
    let outcome = claim_and_execute(&ctx).await;
    assert_eq!(outcome, DriveOutcome::Cancelled);

    let ticket = ticket_db::get_ticket_by_external_id(&ctx.pool, "E-7")
        .await
        .unwrap()
        .unwrap();
    let runs = run_db::list_runs_for_ticket(&ctx.pool, ticket.id).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Cancelled);

    let entries = queue_db::list_entries_for_item(&ctx.pool, "E-7").await.unwrap();
    assert_eq!(entries[0].status, QueueStatus::Cancelled);

    ctx.pool.close().await;
    drop_test_db(&db_name).await;
}
