//! The `StepHandler` trait -- the adapter interface for step execution.
//!
//! Each concrete handler implements one named pipeline step. The trait is
//! intentionally object-safe so handlers can be stored as
//! `Box<dyn StepHandler>` in the [`super::HandlerRegistry`].

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conductor_db::models::StepName;

/// Everything a handler may need about the step it is executing.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub ticket_id: Uuid,
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub step_name: StepName,
    /// Zero-based retry attempt for this step.
    pub attempt: i32,
    /// Cancelled when the run is being cancelled; handlers should stop work
    /// and return promptly once this fires.
    pub cancel: CancellationToken,
}

/// What a handler's invocation produced. The engine maps each variant onto
/// step and run transitions; handlers never touch entity status themselves.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The step finished; `output` is propagated as the next step's input.
    Completed(Value),
    /// Voluntary suspension: persist `checkpoint` and unbind the engine.
    /// Only an external signal (the validation rendezvous) resumes the run.
    Suspend { checkpoint: Value },
    /// Transient failure; the engine requeues the step within its retry
    /// budget.
    Retry { reason: String },
    /// Failure classified by the handler. `retryable: false` fails the step
    /// (and the run) immediately.
    Fail { reason: String, retryable: bool },
}

/// Adapter interface for executing one named pipeline step.
///
/// # Object safety
///
/// This trait is object-safe: every method either returns a concrete type or
/// is async via `async_trait` boxing. Handlers are stored as
/// `Box<dyn StepHandler>` in the registry.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// The step this handler executes.
    fn step(&self) -> StepName;

    /// Execute the step.
    ///
    /// `input` is the previous step's output (absent for the first step);
    /// `checkpoint` is the latest persisted continuation point (absent on a
    /// fresh dispatch). Handlers must be idempotent or checkpoint their own
    /// progress: the engine may re-invoke them after a crash with the last
    /// checkpoint.
    async fn handle(
        &self,
        ctx: &StepContext,
        input: Option<Value>,
        checkpoint: Option<Value>,
    ) -> Result<StepOutcome>;

    /// Whether a crashed mid-flight invocation of this handler may be
    /// re-dispatched from its latest checkpoint. Handlers that cannot
    /// guarantee safe re-execution keep the default `false` and their run
    /// fails with `orphan_on_restart` instead.
    fn resumable(&self) -> bool {
        false
    }
}

// Compile-time assertion: StepHandler must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn StepHandler) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl StepHandler for NoopHandler {
        fn step(&self) -> StepName {
            StepName::Analyze
        }

        async fn handle(
            &self,
            _ctx: &StepContext,
            _input: Option<Value>,
            _checkpoint: Option<Value>,
        ) -> Result<StepOutcome> {
            Ok(StepOutcome::Completed(Value::Null))
        }
    }

    #[test]
    fn handler_is_object_safe() {
        let handler: Box<dyn StepHandler> = Box::new(NoopHandler);
        assert_eq!(handler.step(), StepName::Analyze);
        assert!(!handler.resumable());
    }

    #[tokio::test]
    async fn noop_handler_completes() {
        let handler = NoopHandler;
        let ctx = StepContext {
            ticket_id: Uuid::nil(),
            run_id: Uuid::nil(),
            step_id: Uuid::nil(),
            step_name: StepName::Analyze,
            attempt: 0,
            cancel: CancellationToken::new(),
        };
        let outcome = handler.handle(&ctx, None, None).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Completed(Value::Null)));
    }
}
