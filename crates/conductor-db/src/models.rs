use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enums
//
// Stored as TEXT in PostgreSQL (with CHECK constraints); the transition
// matrix itself lives in the status_transitions reference table and is
// consulted through the StatusRegistry, never hard-coded at call sites.
// ---------------------------------------------------------------------------

/// Status of a ticket (registry category `task`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Processing,
    Testing,
    Debugging,
    QualityCheck,
    AwaitingValidation,
    Completed,
    Failed,
}

impl TicketStatus {
    /// Whether this status permits no further transitions.
    pub fn is_terminal(self) -> bool {
        // Tickets in completed/failed can still be reactivated; reactivation
        // is modelled as a transition back to processing, so these are the
        // "resting" states rather than hard-terminal ones.
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Testing => "testing",
            Self::Debugging => "debugging",
            Self::QualityCheck => "quality_check",
            Self::AwaitingValidation => "awaiting_validation",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TicketStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "testing" => Ok(Self::Testing),
            "debugging" => Ok(Self::Debugging),
            "quality_check" => Ok(Self::QualityCheck),
            "awaiting_validation" => Ok(Self::AwaitingValidation),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StatusParseError::new("ticket", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Running,
    WaitingValidation,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::Running => "running",
            Self::WaitingValidation => "waiting_validation",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "running" => Ok(Self::Running),
            "waiting_validation" => Ok(Self::WaitingValidation),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StatusParseError::new("run", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for StepStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(StatusParseError::new("step", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a pending human validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Approved,
    Rejected,
    ChangesRequested,
    Expired,
    Abandoned,
}

impl ValidationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::ChangesRequested => "changes_requested",
            Self::Expired => "expired",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

impl FromStr for ValidationStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "changes_requested" => Ok(Self::ChangesRequested),
            "expired" => Ok(Self::Expired),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(StatusParseError::new("validation", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Running,
    WaitingValidation,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl QueueStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingValidation => "waiting_validation",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for QueueStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting_validation" => Ok(Self::WaitingValidation),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            other => Err(StatusParseError::new("queue", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Decision carried by a validation response.
///
/// A strict subset of [`ValidationStatus`]: only the three decisions a human
/// can actually submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ValidationDecision {
    Approved,
    Rejected,
    ChangesRequested,
}

impl ValidationDecision {
    /// The validation status this decision transitions the validation to.
    pub fn as_validation_status(self) -> ValidationStatus {
        match self {
            Self::Approved => ValidationStatus::Approved,
            Self::Rejected => ValidationStatus::Rejected,
            Self::ChangesRequested => ValidationStatus::ChangesRequested,
        }
    }
}

impl fmt::Display for ValidationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::ChangesRequested => "changes_requested",
        };
        f.write_str(s)
    }
}

impl FromStr for ValidationDecision {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "changes_requested" => Ok(Self::ChangesRequested),
            other => Err(StatusParseError::new("validation decision", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Error returned when parsing an invalid status string.
#[derive(Debug, Clone)]
pub struct StatusParseError {
    pub category: &'static str,
    pub value: String,
}

impl StatusParseError {
    fn new(category: &'static str, value: &str) -> Self {
        Self {
            category,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} status: {:?}", self.category, self.value)
    }
}

impl std::error::Error for StatusParseError {}

// ---------------------------------------------------------------------------
// Step names
// ---------------------------------------------------------------------------

/// Name of a pipeline step. The engine dispatches each name to a registered
/// handler; the ordered sequences below are the only legal layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Prepare,
    Analyze,
    Implement,
    Test,
    QualityCheck,
    Finalize,
    AwaitValidation,
    Merge,
    Notify,
}

/// The canonical step sequence for a first-class run.
pub const CANONICAL_STEPS: [StepName; 9] = [
    StepName::Prepare,
    StepName::Analyze,
    StepName::Implement,
    StepName::Test,
    StepName::QualityCheck,
    StepName::Finalize,
    StepName::AwaitValidation,
    StepName::Merge,
    StepName::Notify,
];

/// The step sequence for a reactivation run: repository state already exists,
/// so the pipeline starts at `analyze`.
pub const REACTIVATION_STEPS: [StepName; 8] = [
    StepName::Analyze,
    StepName::Implement,
    StepName::Test,
    StepName::QualityCheck,
    StepName::Finalize,
    StepName::AwaitValidation,
    StepName::Merge,
    StepName::Notify,
];

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prepare => "prepare",
            Self::Analyze => "analyze",
            Self::Implement => "implement",
            Self::Test => "test",
            Self::QualityCheck => "quality_check",
            Self::Finalize => "finalize",
            Self::AwaitValidation => "await_validation",
            Self::Merge => "merge",
            Self::Notify => "notify",
        };
        f.write_str(s)
    }
}

impl FromStr for StepName {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prepare" => Ok(Self::Prepare),
            "analyze" => Ok(Self::Analyze),
            "implement" => Ok(Self::Implement),
            "test" => Ok(Self::Test),
            "quality_check" => Ok(Self::QualityCheck),
            "finalize" => Ok(Self::Finalize),
            "await_validation" => Ok(Self::AwaitValidation),
            "merge" => Ok(Self::Merge),
            "notify" => Ok(Self::Notify),
            other => Err(StatusParseError::new("step name", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Reactivation bookkeeping enums
// ---------------------------------------------------------------------------

/// How an inbound event on a terminal ticket was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReactivationClassification {
    Ignore,
    ReopenWithNewRequirement,
    AnswerQuestion,
}

impl fmt::Display for ReactivationClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ignore => "ignore",
            Self::ReopenWithNewRequirement => "reopen_with_new_requirement",
            Self::AnswerQuestion => "answer_question",
        };
        f.write_str(s)
    }
}

impl FromStr for ReactivationClassification {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(Self::Ignore),
            "reopen_with_new_requirement" => Ok(Self::ReopenWithNewRequirement),
            "answer_question" => Ok(Self::AnswerQuestion),
            other => Err(StatusParseError::new("reactivation classification", other)),
        }
    }
}

/// What the reactivation controller did with a classified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReactivationAction {
    Reactivated,
    SkippedCooldown,
    SkippedLocked,
    SkippedDepth,
    SkippedIgnored,
}

impl fmt::Display for ReactivationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Reactivated => "reactivated",
            Self::SkippedCooldown => "skipped_cooldown",
            Self::SkippedLocked => "skipped_locked",
            Self::SkippedDepth => "skipped_depth",
            Self::SkippedIgnored => "skipped_ignored",
        };
        f.write_str(s)
    }
}

impl FromStr for ReactivationAction {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reactivated" => Ok(Self::Reactivated),
            "skipped_cooldown" => Ok(Self::SkippedCooldown),
            "skipped_locked" => Ok(Self::SkippedLocked),
            "skipped_depth" => Ok(Self::SkippedDepth),
            "skipped_ignored" => Ok(Self::SkippedIgnored),
            other => Err(StatusParseError::new("reactivation action", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A ticket -- an external task-tracker item the orchestrator acts on.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Ticket {
    pub id: Uuid,
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub repository_url: String,
    pub status: TicketStatus,
    pub previous_status: Option<TicketStatus>,
    pub is_locked: bool,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub failed_reactivation_attempts: i32,
    pub reactivation_count: i32,
    pub last_run_id: Option<Uuid>,
    pub status_changed_by: Option<String>,
    pub status_change_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A run -- one end-to-end attempt on a ticket.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Run {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub run_number: i32,
    pub status: RunStatus,
    pub current_step: Option<StepName>,
    pub progress_percentage: i32,
    pub parent_run_id: Option<Uuid>,
    pub is_reactivation: bool,
    pub reactivation_depth: i32,
    pub dispatch_handle: Option<String>,
    pub failure_reason: Option<String>,
    pub cancel_requested: bool,
    pub status_changed_by: Option<String>,
    pub status_change_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A step within a run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunStep {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_name: StepName,
    pub step_order: i32,
    pub status: StepStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub input_data: Option<serde_json::Value>,
    pub output_data: Option<serde_json::Value>,
    pub status_changed_by: Option<String>,
    pub status_change_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A persisted continuation point for a suspendable step.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepCheckpoint {
    pub id: Uuid,
    pub step_id: Uuid,
    pub checkpoint_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A pending (or resolved) human validation for a run's proposed output.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Validation {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub external_uuid: Uuid,
    pub status: ValidationStatus,
    pub payload: serde_json::Value,
    pub rejection_count: i32,
    pub parent_validation_id: Option<Uuid>,
    pub status_changed_by: Option<String>,
    pub status_change_reason: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A human response to a validation, correlated by the validation's
/// external UUID.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ValidationResponse {
    pub id: Uuid,
    pub validation_id: Uuid,
    pub decision: ValidationDecision,
    pub comments: Option<String>,
    pub validator_id: String,
    pub responded_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A persisted inbound event awaiting (or undergoing) processing.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueueEntry {
    pub id: Uuid,
    pub item_id: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: QueueStatus,
    pub is_reactivation: bool,
    pub dispatch_handle: Option<String>,
    pub status_changed_by: Option<String>,
    pub status_change_reason: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Audit row recording one reactivation decision.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReactivationTrigger {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub classification: ReactivationClassification,
    pub action: ReactivationAction,
    pub run_id: Option<Uuid>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row of a per-entity status-history table. History rows are written by
/// AFTER UPDATE triggers; this struct is read-only.
///
/// Queries alias the entity FK column (`ticket_id`, `run_id`, ...) to
/// `entity_id` so one struct covers all five history tables.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StatusHistoryRow {
    pub id: i64,
    pub entity_id: Uuid,
    pub from_status: Option<String>,
    pub to_status: String,
    pub changed_by: Option<String>,
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// A row of the status_types reference table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StatusTypeRow {
    pub category: String,
    pub name: String,
    pub is_terminal: bool,
}

/// A row of the status_transitions reference table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StatusTransitionRow {
    pub category: String,
    pub from_status: String,
    pub to_status: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
