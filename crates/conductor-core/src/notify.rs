//! Outbound notification records.
//!
//! The core produces pure data records; delivery (chat, e-mail, tracker
//! comments) is an external collaborator behind the [`Notifier`] trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A validation is pending and a human should look at it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationPending {
    /// The external correlation UUID the response must carry.
    pub uuid: Uuid,
    pub ticket_id: Uuid,
    pub run_id: Uuid,
    /// Free-form hint about who should validate (e.g. the ticket reporter).
    pub validator_hint: Option<String>,
    /// The proposed change: summary, files changed, PR info.
    pub payload: serde_json::Value,
}

/// A run reached a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompleted {
    pub ticket_id: Uuid,
    pub run_id: Uuid,
    /// Terminal run status as text (`completed` / `failed` / `cancelled`).
    pub outcome: String,
    /// Failure reason from the closed vocabulary, when failed.
    pub reason: Option<String>,
}

/// Delivery surface for outbound notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_validation_pending(&self, notification: ValidationPending);
    async fn notify_run_completed(&self, notification: RunCompleted);
}

/// Default notifier: structured log lines only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify_validation_pending(&self, notification: ValidationPending) {
        tracing::info!(
            uuid = %notification.uuid,
            ticket_id = %notification.ticket_id,
            run_id = %notification.run_id,
            "validation pending"
        );
    }

    async fn notify_run_completed(&self, notification: RunCompleted) {
        tracing::info!(
            ticket_id = %notification.ticket_id,
            run_id = %notification.run_id,
            outcome = %notification.outcome,
            reason = notification.reason.as_deref().unwrap_or(""),
            "run completed"
        );
    }
}

pub mod test_support {
    //! A notifier that records everything it is handed, for assertions.

    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        pub validations: Mutex<Vec<ValidationPending>>,
        pub completions: Mutex<Vec<RunCompleted>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_validation_pending(&self, notification: ValidationPending) {
            self.validations.lock().unwrap().push(notification);
        }

        async fn notify_run_completed(&self, notification: RunCompleted) {
            self.completions.lock().unwrap().push(notification);
        }
    }
}
