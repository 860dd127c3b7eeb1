//! The orchestrator bundle: every collaborator and tunable, dependency-passed
//! and owned in one place.
//!
//! There are no service singletons; a test harness builds an
//! [`OrchestratorContext`] with a manual clock, stub handlers, and the local
//! broker, and reaches every interleaving deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::Broker;
use crate::clock::Clock;
use crate::handler::{AwaitValidationHandler, HandlerRegistry};
use crate::lock::{CooldownManager, LockManager};
use crate::notify::Notifier;
use crate::reactivation::ReactivationClassifier;
use crate::registry::StatusRegistry;
use crate::transition::TransitionGuard;
use crate::validation::ValidationRendezvous;

/// All tunables, sourced from the environment with documented defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    /// `LOCK_TTL_SECONDS`, default 1800.
    pub lock_ttl: Duration,
    /// `QUEUE_TIMEOUT_SECONDS`, default 7200: wall-clock budget per running
    /// queue entry.
    pub queue_timeout: Duration,
    /// `VALIDATION_TTL_HOURS`, default 72.
    pub validation_ttl: Duration,
    /// `MAX_REACTIVATION_DEPTH`, default 20.
    pub max_reactivation_depth: i32,
    /// `MAX_REJECTIONS`, default 3.
    pub max_rejections: i32,
    /// `STEP_RETRY_BACKOFF_SECONDS_BASE`, default 30: linear factor for
    /// step-local retry backoff.
    pub step_retry_backoff: Duration,
    /// `COOLDOWN_BASE_SECONDS`, default 60.
    pub cooldown_base: Duration,
    /// `COOLDOWN_CAP_SECONDS`, default 1800.
    pub cooldown_cap: Duration,
    /// Per-step retry budget, default 3.
    pub max_step_retries: i32,
    /// Concurrent engine workers, default 4.
    pub max_workers: usize,
    /// Grace window for a cancelled handler to acknowledge, default 30 s.
    pub cancel_grace: Duration,
    /// Dedup window for inbound event IDs, default 24 h.
    pub dedup_window: Duration,
    /// Lock-holder identity for this process.
    pub holder: String,
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    /// Read settings from the environment, falling back to the documented
    /// defaults.
    pub fn from_env() -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "conductor".to_owned());
        Self {
            lock_ttl: Duration::from_secs(env_u64("LOCK_TTL_SECONDS", 1800)),
            queue_timeout: Duration::from_secs(env_u64("QUEUE_TIMEOUT_SECONDS", 7200)),
            validation_ttl: Duration::from_secs(env_u64("VALIDATION_TTL_HOURS", 72) * 3600),
            max_reactivation_depth: env_u64("MAX_REACTIVATION_DEPTH", 20) as i32,
            max_rejections: env_u64("MAX_REJECTIONS", 3) as i32,
            step_retry_backoff: Duration::from_secs(env_u64(
                "STEP_RETRY_BACKOFF_SECONDS_BASE",
                30,
            )),
            cooldown_base: Duration::from_secs(env_u64("COOLDOWN_BASE_SECONDS", 60)),
            cooldown_cap: Duration::from_secs(env_u64("COOLDOWN_CAP_SECONDS", 1800)),
            max_step_retries: env_u64("MAX_STEP_RETRIES", 3) as i32,
            max_workers: env_u64("MAX_WORKERS", 4) as usize,
            cancel_grace: Duration::from_secs(env_u64("CANCEL_GRACE_SECONDS", 30)),
            dedup_window: Duration::from_secs(24 * 3600),
            holder: format!("conductor-{hostname}-{}", std::process::id()),
        }
    }

    /// Defaults with fast timings, for tests that drive real sleeps.
    pub fn for_tests() -> Self {
        Self {
            lock_ttl: Duration::from_secs(1800),
            queue_timeout: Duration::from_secs(7200),
            validation_ttl: Duration::from_secs(72 * 3600),
            max_reactivation_depth: 20,
            max_rejections: 3,
            step_retry_backoff: Duration::from_millis(10),
            cooldown_base: Duration::from_secs(60),
            cooldown_cap: Duration::from_secs(1800),
            max_step_retries: 3,
            max_workers: 4,
            cancel_grace: Duration::from_millis(200),
            dedup_window: Duration::from_secs(24 * 3600),
            holder: format!("conductor-test-{}", std::process::id()),
        }
    }
}

/// The dependency bundle every component receives.
pub struct OrchestratorContext {
    pub pool: PgPool,
    pub registry: Arc<StatusRegistry>,
    pub guard: TransitionGuard,
    pub handlers: Arc<HandlerRegistry>,
    pub broker: Arc<dyn Broker>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub classifier: Arc<dyn ReactivationClassifier>,
    pub settings: Settings,
    pub lock: LockManager,
    pub cooldown: Arc<CooldownManager>,
    rendezvous: Arc<ValidationRendezvous>,
    /// Cancellation tokens of currently bound workers, keyed by run ID. The
    /// cancel watchdog fires these for runs flagged `cancel_requested`.
    run_tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl OrchestratorContext {
    /// Build the bundle. Loads the status registry (so `conductor migrate`
    /// must have run), registers the built-in `await_validation` handler on
    /// top of the provided registry, and wires the lock and cooldown
    /// managers to the shared clock.
    pub async fn new(
        pool: PgPool,
        mut handlers: HandlerRegistry,
        broker: Arc<dyn Broker>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        classifier: Arc<dyn ReactivationClassifier>,
        settings: Settings,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(StatusRegistry::load(&pool).await?);
        let guard = TransitionGuard::new(Arc::clone(&registry));

        let lock = LockManager::new(pool.clone(), Arc::clone(&clock), settings.lock_ttl);
        let cooldown = Arc::new(CooldownManager::new(
            pool.clone(),
            Arc::clone(&clock),
            settings.cooldown_base,
            settings.cooldown_cap,
        ));

        let rendezvous = Arc::new(ValidationRendezvous::new(
            pool.clone(),
            guard.clone(),
            Arc::clone(&clock),
            Arc::clone(&notifier),
            Arc::clone(&cooldown),
            settings.clone(),
        ));
        handlers.register(AwaitValidationHandler::new(
            pool.clone(),
            Arc::clone(&rendezvous),
        ));

        Ok(Arc::new(Self {
            pool,
            registry,
            guard,
            handlers: Arc::new(handlers),
            broker,
            notifier,
            clock,
            classifier,
            settings,
            lock,
            cooldown,
            rendezvous,
            run_tokens: Mutex::new(HashMap::new()),
        }))
    }

    pub fn rendezvous(&self) -> Arc<ValidationRendezvous> {
        Arc::clone(&self.rendezvous)
    }

    pub fn register_run_token(&self, run_id: Uuid, token: CancellationToken) {
        self.run_tokens.lock().unwrap().insert(run_id, token);
    }

    pub fn forget_run_token(&self, run_id: Uuid) {
        self.run_tokens.lock().unwrap().remove(&run_id);
    }

    /// Fire the cancellation token of a bound worker, if one is bound.
    /// Returns whether a token was found.
    pub fn cancel_run_token(&self, run_id: Uuid) -> bool {
        let tokens = self.run_tokens.lock().unwrap();
        match tokens.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults_match_documented_values() {
        // from_env with a clean environment yields the documented defaults.
        let s = Settings::for_tests();
        assert_eq!(s.lock_ttl, Duration::from_secs(1800));
        assert_eq!(s.queue_timeout, Duration::from_secs(7200));
        assert_eq!(s.validation_ttl, Duration::from_secs(72 * 3600));
        assert_eq!(s.max_reactivation_depth, 20);
        assert_eq!(s.max_rejections, 3);
        assert_eq!(s.cooldown_base, Duration::from_secs(60));
        assert_eq!(s.cooldown_cap, Duration::from_secs(1800));
    }

    #[test]
    fn holder_identity_is_process_scoped() {
        let s = Settings::for_tests();
        assert!(s.holder.contains(&std::process::id().to_string()));
    }
}
