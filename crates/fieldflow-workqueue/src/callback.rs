//! Best-effort terminal-outcome callbacks.

use std::time::Duration;

use serde_json::json;
use tracing::debug;

use crate::error::QueueError;
use crate::task::Task;

/// Delivers terminal-outcome notifications to a task's callback URL.
///
/// One attempt per task, fire-and-forget. Delivery failures surface as
/// [`QueueError::CallbackDelivery`] so the caller can log them; they
/// never alter task state and are never retried.
pub struct CallbackDispatcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl CallbackDispatcher {
    /// Create a dispatcher with the given per-request timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Notify the task's callback URL of its terminal outcome, if one
    /// is set.
    pub async fn dispatch(&self, task: &Task) -> Result<(), QueueError> {
        let Some(url) = task.callback_url.as_deref() else {
            return Ok(());
        };

        let payload = json!({
            "task_id": task.id,
            "task_type": task.task_type,
            "status": task.status.as_str(),
            "attempts": task.attempts,
            "result": task.result,
            "error": task.last_error,
        });

        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| QueueError::CallbackDelivery(task.id, e.to_string()))?;

        if response.status().is_success() {
            debug!("Delivered callback for task {} to {}", task.id, url);
            Ok(())
        } else {
            Err(QueueError::CallbackDelivery(
                task.id,
                format!("{} returned {}", url, response.status()),
            ))
        }
    }
}
