//! Task record and lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Coarse scheduling class. High strictly precedes Normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    /// Routine work orders.
    Normal = 0,
    /// Escalations and SLA-critical work.
    High = 1,
}

impl Default for PriorityTier {
    fn default() -> Self {
        PriorityTier::Normal
    }
}

impl PriorityTier {
    /// Integer code persisted in the database.
    pub fn code(&self) -> i64 {
        *self as i64
    }

    /// Reverse of [`code`](Self::code).
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(PriorityTier::Normal),
            1 => Some(PriorityTier::High),
            _ => None,
        }
    }
}

/// Task lifecycle status.
///
/// Completed and DeadLetter are terminal. Failed is only ever assigned
/// by operator tooling; the engine moves a failed attempt straight back
/// to Pending (with a backoff window) or to DeadLetter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Finished successfully.
    Completed,
    /// Marked failed outside the retry cycle.
    Failed,
    /// Retry budget exhausted; excluded from claiming permanently.
    DeadLetter,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

impl TaskStatus {
    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLetter => "dead_letter",
        }
    }

    /// Parse the database representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "dead_letter" => Some(TaskStatus::DeadLetter),
            _ => None,
        }
    }

    /// No further transitions occur from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::DeadLetter)
    }
}

/// A unit of work in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID, assigned at creation, immutable.
    pub id: Uuid,
    /// Names the registered handler that processes this task.
    pub task_type: String,
    /// Opaque data passed verbatim to the handler.
    pub payload: Value,
    /// Coarse scheduling class.
    pub priority: PriorityTier,
    /// Fine-grained ordering within a tier (higher = sooner).
    pub weight: i32,
    /// Current status.
    pub status: TaskStatus,
    /// Failed claim-and-execute cycles so far.
    pub attempts: u32,
    /// Attempt ceiling. Zero means "apply the queue default at enqueue".
    pub max_attempts: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Earliest eligible claim time (None = immediately). Retries park
    /// here until their backoff window elapses.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Result recorded on completion.
    pub result: Option<Value>,
    /// Last error message recorded on a failed attempt.
    pub last_error: Option<String>,
    /// Destination for the terminal-outcome notification.
    pub callback_url: Option<String>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            payload,
            priority: PriorityTier::Normal,
            weight: 0,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            result: None,
            last_error: None,
            callback_url: None,
        }
    }

    /// Set the priority tier.
    pub fn with_priority(mut self, priority: PriorityTier) -> Self {
        self.priority = priority;
        self
    }

    /// Set the within-tier weight.
    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    /// Set an explicit attempt ceiling.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Set the terminal-outcome callback URL.
    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    /// Defer execution until the given time.
    pub fn with_scheduled_at(mut self, time: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(time);
        self
    }

    /// Check if the task has retry budget left.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Check if the task is eligible for claiming right now.
    pub fn is_ready(&self) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }

        match self.scheduled_at {
            Some(at) => at <= Utc::now(),
            None => true,
        }
    }
}
