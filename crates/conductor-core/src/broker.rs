//! The work-dispatch broker seam.
//!
//! The orchestrator does not implement a durable message queue; the broker
//! is a dispatch channel that mints work-item handles. Handles are stored on
//! queue entries and runs, and crash recovery asks the broker which handles
//! are still live. [`LocalBroker`] is the in-process default: handles are
//! live exactly while a worker in this process holds one, so after a restart
//! every previously dispatched handle reads as dead -- which is precisely
//! what the orphan scan needs.

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use conductor_db::models::QueueEntry;

/// Dispatch channel for queue entries.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Dispatch an entry, returning the broker's work-item handle.
    async fn dispatch(&self, entry: &QueueEntry) -> Result<String>;

    /// Whether a handle still has a live worker bound to it.
    async fn is_live(&self, handle: &str) -> bool;

    /// Mark a handle finished (worker returned, suspended, or failed).
    async fn complete(&self, handle: &str) -> Result<()>;

    /// Ask the worker bound to a handle to stop.
    async fn cancel(&self, handle: &str) -> Result<()>;
}

/// In-process broker: work is executed by this process's worker pool.
///
/// Bookkeeping rows go to `external.broker_jobs`; the core never reads them
/// back -- they exist for operators and for parity with external brokers
/// that keep their own state table.
pub struct LocalBroker {
    pool: PgPool,
    live: Mutex<HashSet<String>>,
}

impl LocalBroker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            live: Mutex::new(HashSet::new()),
        }
    }

    fn mark_live(&self, handle: &str) {
        self.live.lock().unwrap().insert(handle.to_owned());
    }

    fn mark_dead(&self, handle: &str) -> bool {
        self.live.lock().unwrap().remove(handle)
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn dispatch(&self, entry: &QueueEntry) -> Result<String> {
        let handle = format!("local-{}", Uuid::new_v4());

        sqlx::query(
            "INSERT INTO external.broker_jobs (handle, queue_id, state) \
             VALUES ($1, $2, 'dispatched')",
        )
        .bind(&handle)
        .bind(entry.id)
        .execute(&self.pool)
        .await
        .context("failed to record broker job")?;

        self.mark_live(&handle);
        Ok(handle)
    }

    async fn is_live(&self, handle: &str) -> bool {
        self.live.lock().unwrap().contains(handle)
    }

    async fn complete(&self, handle: &str) -> Result<()> {
        self.mark_dead(handle);
        sqlx::query(
            "UPDATE external.broker_jobs SET state = 'finished', updated_at = NOW() \
             WHERE handle = $1",
        )
        .bind(handle)
        .execute(&self.pool)
        .await
        .context("failed to finish broker job")?;
        Ok(())
    }

    async fn cancel(&self, handle: &str) -> Result<()> {
        self.mark_dead(handle);
        sqlx::query(
            "UPDATE external.broker_jobs SET state = 'cancelled', updated_at = NOW() \
             WHERE handle = $1",
        )
        .bind(handle)
        .execute(&self.pool)
        .await
        .context("failed to cancel broker job")?;
        Ok(())
    }
}
