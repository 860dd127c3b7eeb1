//! Step handlers -- the adapter interface to the external execution surface.
//!
//! The engine owns step sequencing, retries, and checkpoints; what a step
//! actually *does* (LLM calls, code generation, PR creation) lives behind
//! the [`StepHandler`] trait. The engine only observes the returned
//! [`StepOutcome`] variant.

mod builtin;
mod registry;
mod trait_def;

pub use builtin::{passthrough_defaults, AwaitValidationHandler, PassthroughHandler};
pub use registry::HandlerRegistry;
pub use trait_def::{StepContext, StepHandler, StepOutcome};
