//! Queue errors.

use thiserror::Error;
use uuid::Uuid;

/// Queue error types.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Malformed enqueue arguments; the task was never created.
    #[error("Invalid task: {0}")]
    Validation(String),

    /// Operation referenced an unknown task id.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// Durable-store I/O failure. Callers must not assume a task's
    /// state changed when this is raised.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// No handler registered for the task's type. Non-retryable.
    #[error("No handler registered for task type '{0}'")]
    HandlerNotFound(String),

    /// The handler signaled failure; retried until the budget runs out.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// Outbound notification failed. Logged only, never fed back into
    /// the task's own lifecycle.
    #[error("Callback delivery for task {0} failed: {1}")]
    CallbackDelivery(Uuid, String),

    /// Worker pool error.
    #[error("Worker error: {0}")]
    Worker(String),
}
