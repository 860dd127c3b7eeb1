//! Handler registry -- a per-step-name collection of handler adapters.

use std::collections::HashMap;

use conductor_db::models::StepName;

use super::trait_def::StepHandler;

/// A collection of registered [`StepHandler`] implementations, keyed by the
/// step name each one declares.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<StepName, Box<dyn StepHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the step name it declares.
    ///
    /// If a handler for the same step is already registered, it is replaced
    /// and the old one is returned.
    pub fn register(&mut self, handler: impl StepHandler + 'static) -> Option<Box<dyn StepHandler>> {
        let step = handler.step();
        self.handlers.insert(step, Box::new(handler))
    }

    /// Register a boxed handler (for dynamically built handlers).
    pub fn register_boxed(&mut self, handler: Box<dyn StepHandler>) -> Option<Box<dyn StepHandler>> {
        let step = handler.step();
        self.handlers.insert(step, handler)
    }

    /// Look up the handler for a step.
    pub fn get(&self, step: StepName) -> Option<&dyn StepHandler> {
        self.handlers.get(&step).map(|b| b.as_ref())
    }

    /// List the steps with a registered handler.
    pub fn list(&self) -> Vec<StepName> {
        self.handlers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// The step names from `required` that have no registered handler.
    pub fn missing_from(&self, required: &[StepName]) -> Vec<StepName> {
        required
            .iter()
            .copied()
            .filter(|s| !self.handlers.contains_key(s))
            .collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("steps", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::trait_def::{StepContext, StepOutcome};
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::Value;

    struct FakeHandler {
        for_step: StepName,
    }

    #[async_trait]
    impl StepHandler for FakeHandler {
        fn step(&self) -> StepName {
            self.for_step
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
    fn registry_starts_empty() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn register_and_get() {
        let mut registry = HandlerRegistry::new();
        let old = registry.register(FakeHandler {
            for_step: StepName::Implement,
        });
        assert!(old.is_none());

        let handler = registry.get(StepName::Implement);
        assert!(handler.is_some());
        assert_eq!(handler.unwrap().step(), StepName::Implement);
        assert!(registry.get(StepName::Merge).is_none());
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = HandlerRegistry::new();
        registry.register(FakeHandler {
            for_step: StepName::Test,
        });
        let old = registry.register(FakeHandler {
            for_step: StepName::Test,
        });
        assert!(old.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn missing_from_reports_gaps() {
        let mut registry = HandlerRegistry::new();
        registry.register(FakeHandler {
            for_step: StepName::Analyze,
        });

        let missing = registry.missing_from(&[StepName::Analyze, StepName::Merge]);
        assert_eq!(missing, vec![StepName::Merge]);
    }
}
