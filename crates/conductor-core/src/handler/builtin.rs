//! Handlers shipped with the core.
//!
//! [`AwaitValidationHandler`] is the one step the core owns end-to-end: it
//! opens the validation rendezvous and suspends. [`PassthroughHandler`] is
//! the default stand-in for the externally-executed steps (analysis, code
//! generation, PR creation live outside the orchestrator); embedders replace
//! it with real adapters at wiring time.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::PgPool;

use conductor_db::models::StepName;
use conductor_db::queries::runs as run_db;

use crate::error::OrchestratorError;
use crate::validation::ValidationRendezvous;

use super::registry::HandlerRegistry;
use super::trait_def::{StepContext, StepHandler, StepOutcome};

/// A registry pre-populated with [`PassthroughHandler`]s for every
/// externally-executed step. `await_validation` is not included; the
/// orchestrator bundle registers the real [`AwaitValidationHandler`] itself.
pub fn passthrough_defaults() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for step in [
        StepName::Prepare,
        StepName::Analyze,
        StepName::Implement,
        StepName::Test,
        StepName::QualityCheck,
        StepName::Finalize,
        StepName::Merge,
        StepName::Notify,
    ] {
        registry.register(PassthroughHandler::new(step));
    }
    registry
}

/// Opens a validation for the run's proposed output and suspends until the
/// rendezvous resumes the run.
pub struct AwaitValidationHandler {
    pool: PgPool,
    rendezvous: Arc<ValidationRendezvous>,
}

impl AwaitValidationHandler {
    pub fn new(pool: PgPool, rendezvous: Arc<ValidationRendezvous>) -> Self {
        Self { pool, rendezvous }
    }
}

#[async_trait]
impl StepHandler for AwaitValidationHandler {
    fn step(&self) -> StepName {
        StepName::AwaitValidation
    }

    async fn handle(
        &self,
        ctx: &StepContext,
        input: Option<Value>,
        _checkpoint: Option<Value>,
    ) -> Result<StepOutcome> {
        let run = run_db::get_run(&self.pool, ctx.run_id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                entity: "run",
                id: ctx.run_id,
            })?;

        // The finalize step's output describes the proposed change; that is
        // what the validator sees.
        let payload = input.unwrap_or_else(|| json!({}));
        let validation = self.rendezvous.open(&run, ctx.step_id, payload).await?;

        Ok(StepOutcome::Suspend {
            checkpoint: json!({ "validation_uuid": validation.external_uuid }),
        })
    }

    // Re-opening is a no-op when a pending validation already exists, so a
    // crashed invocation can always be re-dispatched.
    fn resumable(&self) -> bool {
        true
    }
}

/// Default stand-in for externally-executed steps: completes immediately,
/// passing its input through annotated with the step name.
///
/// The `merge` instance carries `idempotency_key = run_id` in its output --
/// the contract real merge adapters must honour so a crash-recovered
/// re-dispatch cannot produce a second merge.
pub struct PassthroughHandler {
    for_step: StepName,
}

impl PassthroughHandler {
    pub fn new(for_step: StepName) -> Self {
        Self { for_step }
    }
}

#[async_trait]
impl StepHandler for PassthroughHandler {
    fn step(&self) -> StepName {
        self.for_step
    }

    async fn handle(
        &self,
        ctx: &StepContext,
        input: Option<Value>,
        _checkpoint: Option<Value>,
    ) -> Result<StepOutcome> {
        let mut output = json!({
            "step": self.for_step.to_string(),
            "input": input.unwrap_or(Value::Null),
        });
        if self.for_step == StepName::Merge {
            output["idempotency_key"] = json!(ctx.run_id);
        }
        Ok(StepOutcome::Completed(output))
    }

    fn resumable(&self) -> bool {
        true
    }
}
