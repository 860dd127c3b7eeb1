//! The closed error vocabulary surfaced by the core.
//!
//! Most plumbing propagates `anyhow::Error`; flows that callers must branch
//! on carry an [`OrchestratorError`] inside the anyhow chain and match it
//! out with `downcast_ref`.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Typed error kinds callers are expected to match on.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The status registry rejected a transition.
    #[error("invalid {category} transition: {from} -> {to}")]
    InvalidTransition {
        category: &'static str,
        from: String,
        to: String,
    },

    /// A compare-and-update lost its race; retried internally before this
    /// surfaces.
    #[error("concurrent status change on {entity} {id}")]
    ConcurrentStatusChange { entity: &'static str, id: Uuid },

    /// The compare-and-update retry budget is exhausted.
    #[error("conflict on {entity} {id} after {attempts} attempts")]
    Conflict {
        entity: &'static str,
        id: Uuid,
        attempts: u32,
    },

    /// The advisory lock is held by another holder. Not an error to users;
    /// callers queue behind it.
    #[error("lock refused for ticket {ticket_id} (held by {holder:?})")]
    LockRefused {
        ticket_id: Uuid,
        holder: Option<String>,
    },

    /// The ticket is under a cooldown embargo.
    #[error("ticket {ticket_id} cooling down until {until}")]
    TicketCoolingDown {
        ticket_id: Uuid,
        until: DateTime<Utc>,
    },

    /// A validation response arrived after the validation's TTL.
    #[error("validation {uuid} expired at {expires_at}")]
    ValidationExpired {
        uuid: Uuid,
        expires_at: DateTime<Utc>,
    },

    /// A second response arrived for an already-resolved validation.
    /// Maps to HTTP 409.
    #[error("validation {uuid} already has a response")]
    ValidationConflict { uuid: Uuid },

    /// The reactivation chain hit its depth cap; requires manual reset.
    #[error("reactivation depth {depth} exceeds cap {cap} for ticket {ticket_id}")]
    ReactivationDepthExceeded {
        ticket_id: Uuid,
        depth: i32,
        cap: i32,
    },

    /// Crash recovery found a run it cannot safely resume.
    #[error("run {run_id} cannot be resumed after restart: {detail}")]
    OrphanOnRestart { run_id: Uuid, detail: String },

    /// A queue entry exceeded its wall-clock budget.
    #[error("queue entry {entry_id} exceeded its wall-clock budget")]
    OrchestratorTimeout { entry_id: Uuid },

    /// A write targeted a soft-deleted row.
    #[error("{entity} {id} is soft-deleted")]
    ModifyDeleted { entity: &'static str, id: Uuid },

    /// The referenced entity does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
}

/// The closed vocabulary of run failure reasons. Handler-supplied reasons
/// extend this set; everything the core itself writes comes from here.
pub mod reasons {
    pub const ORCHESTRATOR_TIMEOUT: &str = "orchestrator_timeout";
    pub const ORPHAN_ON_RESTART: &str = "orphan_on_restart";
    pub const VALIDATION_EXPIRED: &str = "validation_expired";
    pub const VALIDATION_ABANDONED_LIMIT: &str = "validation_abandoned_limit";
    pub const VALIDATION_REJECTED: &str = "validation_rejected";
    pub const CHANGES_REQUESTED: &str = "changes_requested";
    pub const CANCEL_GRACE_EXCEEDED: &str = "cancel_grace_exceeded";
    pub const CANCELLED: &str = "cancelled";
    pub const STEP_RETRIES_EXHAUSTED: &str = "step_retries_exhausted";
    pub const REACTIVATION_DEPTH_EXCEEDED: &str = "reactivation_depth_exceeded";
    pub const TICKET_MISSING: &str = "ticket_missing";
}

/// Pull an [`OrchestratorError`] out of an anyhow chain, if one is there.
pub fn as_orchestrator_error(err: &anyhow::Error) -> Option<&OrchestratorError> {
    err.downcast_ref::<OrchestratorError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_through_anyhow_context() {
        use anyhow::Context;

        let base: anyhow::Result<()> = Err(OrchestratorError::OrchestratorTimeout {
            entry_id: Uuid::nil(),
        }
        .into());
        let wrapped = base.context("while draining").unwrap_err();

        let found = as_orchestrator_error(&wrapped).expect("should downcast");
        assert!(matches!(
            found,
            OrchestratorError::OrchestratorTimeout { .. }
        ));
    }

    #[test]
    fn display_messages_name_the_entity() {
        let err = OrchestratorError::Conflict {
            entity: "run",
            id: Uuid::nil(),
            attempts: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("run"), "message should name the entity: {msg}");
        assert!(msg.contains('3'), "message should carry attempts: {msg}");
    }
}
