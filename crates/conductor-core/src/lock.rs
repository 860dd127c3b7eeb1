//! The per-ticket advisory lock and the reactivation cooldown.
//!
//! The lock is a TTL-bounded flag on the tickets row, taken and released
//! with single atomic UPDATEs. A periodic sweeper is the only unlock path
//! besides an explicit holder release. The cooldown is an exponential
//! embargo keyed by the ticket's failed-reactivation counter; the counter is
//! reset by trigger on any successful run completion.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use conductor_db::models::Ticket;
use conductor_db::queries::tickets as ticket_db;

use crate::clock::Clock;
use crate::error::OrchestratorError;

/// Exact cooldown backoff: `min(base * 2^(attempt-1), cap)`.
///
/// `attempt` is 1-based (the first failure yields the base backoff).
pub fn cooldown_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 2u64.saturating_pow(attempt - 1);
    let backoff = base.as_secs().saturating_mul(factor);
    Duration::from_secs(backoff.min(cap.as_secs()))
}

/// Manager for the per-ticket advisory lock.
pub struct LockManager {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl LockManager {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { pool, clock, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::minutes(30))
    }

    /// Try to acquire the lock for `holder`.
    ///
    /// Succeeds when the ticket is unlocked or when the existing lock's TTL
    /// has lapsed (a lapsed lock may be stolen without waiting for the
    /// sweeper). Returns `true` on acquisition.
    pub async fn acquire(&self, ticket_id: Uuid, holder: &str) -> Result<bool> {
        let now = self.clock.now();
        let stale_before = now - self.ttl_chrono();
        let rows = ticket_db::try_acquire_lock(&self.pool, ticket_id, holder, now, stale_before)
            .await?;
        let acquired = rows > 0;
        debug!(ticket_id = %ticket_id, holder = holder, acquired = acquired, "lock acquire");
        Ok(acquired)
    }

    /// Acquire or fail with a typed `LockRefused` carrying the current
    /// holder.
    pub async fn acquire_or_refuse(&self, ticket_id: Uuid, holder: &str) -> Result<()> {
        if self.acquire(ticket_id, holder).await? {
            return Ok(());
        }
        let current = ticket_db::get_ticket(&self.pool, ticket_id)
            .await?
            .and_then(|t| t.locked_by);
        Err(OrchestratorError::LockRefused {
            ticket_id,
            holder: current,
        }
        .into())
    }

    /// Release the lock if `holder` still owns it. Returns `true` when the
    /// lock was actually released.
    pub async fn release(&self, ticket_id: Uuid, holder: &str) -> Result<bool> {
        let rows = ticket_db::release_lock(&self.pool, ticket_id, holder).await?;
        if rows == 0 {
            // Lost to the sweeper or a TTL steal; not fatal, but worth a
            // trace since it means the TTL was outlived.
            warn!(ticket_id = %ticket_id, holder = holder, "release found no lock held by us");
        }
        Ok(rows > 0)
    }

    /// Force-release every lock past its TTL. This is the sweeper's path and
    /// the only legal unlock besides [`Self::release`]. Returns the affected
    /// tickets.
    pub async fn sweep(&self) -> Result<Vec<Ticket>> {
        let stale_before = self.clock.now() - self.ttl_chrono();
        let broken = ticket_db::force_release_stale_locks(&self.pool, stale_before).await?;
        for ticket in &broken {
            warn!(
                ticket_id = %ticket.id,
                external_id = %ticket.external_id,
                "force-released stale ticket lock"
            );
        }
        Ok(broken)
    }
}

/// Manager for the reactivation cooldown embargo.
pub struct CooldownManager {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    base: Duration,
    cap: Duration,
}

impl CooldownManager {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>, base: Duration, cap: Duration) -> Self {
        Self {
            pool,
            clock,
            base,
            cap,
        }
    }

    /// Whether the ticket is currently under embargo.
    pub async fn is_in_cooldown(&self, ticket_id: Uuid) -> Result<bool> {
        let ticket = ticket_db::get_ticket(&self.pool, ticket_id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                entity: "ticket",
                id: ticket_id,
            })?;
        Ok(self.embargo_until(&ticket).is_some())
    }

    /// The embargo deadline, if one is active right now.
    pub fn embargo_until(&self, ticket: &Ticket) -> Option<DateTime<Utc>> {
        ticket
            .cooldown_until
            .filter(|until| *until > self.clock.now())
    }

    /// Record a reactivation failure: bump the counter and set
    /// `cooldown_until` with the exponential backoff, both in one statement.
    /// Returns the new attempt count and the embargo deadline.
    pub async fn enter(&self, ticket_id: Uuid) -> Result<(i32, DateTime<Utc>)> {
        let (attempts, until) = ticket_db::enter_cooldown(
            &self.pool,
            ticket_id,
            self.clock.now(),
            self.base.as_secs() as f64,
            self.cap.as_secs() as f64,
        )
        .await?;
        debug!(
            ticket_id = %ticket_id,
            attempts = attempts,
            until = %until,
            "ticket entered cooldown"
        );
        Ok((attempts, until))
    }
}
