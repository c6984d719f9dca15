//! Task persistence and atomic state transitions.
//!
//! The store is the sole source of truth for task state. All claim and
//! update operations are atomic with respect to each other; handler
//! execution happens entirely outside the store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::scheduler::within_tier_cmp;
use crate::task::{PriorityTier, Task, TaskStatus};

/// Counts of tasks by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_letter: u64,
    pub total: u64,
}

impl QueueStats {
    pub(crate) fn count(&mut self, status: TaskStatus, n: u64) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::Processing => self.processing += n,
            TaskStatus::Completed => self.completed += n,
            TaskStatus::Failed => self.failed += n,
            TaskStatus::DeadLetter => self.dead_letter += n,
        }
        self.total += n;
    }
}

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Task returned to Pending, eligible again at the given time.
    Scheduled(DateTime<Utc>),
    /// Retry budget exhausted; task dead-lettered.
    DeadLettered,
}

/// Durable record of every task and its lifecycle state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new Pending task.
    async fn insert(&self, task: &Task) -> Result<(), QueueError>;

    /// Atomically claim the next eligible Pending task and transition
    /// it to Processing. The first tier in `tiers` with an eligible
    /// task wins; within a tier, higher weight first, then FIFO.
    /// Exactly one of two concurrent callers racing on the same task
    /// succeeds.
    async fn claim_next(&self, tiers: &[PriorityTier]) -> Result<Option<Task>, QueueError>;

    /// Processing -> Completed, recording the result. A no-op on a task
    /// that is already terminal.
    async fn complete(&self, id: Uuid, result: Value) -> Result<(), QueueError>;

    /// Record a failed attempt: back to Pending until `retry_at` if
    /// budget remains, otherwise DeadLetter.
    async fn retry(
        &self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<RetryDisposition, QueueError>;

    /// Force a task to DeadLetter regardless of remaining attempts.
    async fn dead_letter(&self, id: Uuid, error: &str) -> Result<(), QueueError>;

    /// Fetch a snapshot of a task.
    async fn get(&self, id: Uuid) -> Result<Task, QueueError>;

    /// Counts by status.
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// All dead-lettered tasks, oldest first.
    async fn dead_letter_tasks(&self) -> Result<Vec<Task>, QueueError>;

    /// Return tasks stranded in Processing (a previous owner died
    /// mid-flight) to Pending without consuming an attempt. Called once
    /// before workers start.
    async fn reclaim_processing(&self) -> Result<u64, QueueError>;
}

/// Reject tasks the queue must never accept.
pub(crate) fn validate_new(task: &Task) -> Result<(), QueueError> {
    if task.task_type.trim().is_empty() {
        return Err(QueueError::Validation("task type must not be empty".into()));
    }
    if task.max_attempts == 0 {
        return Err(QueueError::Validation("max_attempts must be at least 1".into()));
    }
    Ok(())
}

/// In-memory task store for tests and ephemeral deployments.
///
/// A single write lock covers every mutation, so the claim transition
/// is atomic by construction.
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl MemoryTaskStore {
    /// Create a new memory store.
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: &Task) -> Result<(), QueueError> {
        validate_new(task)?;

        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(QueueError::Validation(format!("duplicate task id {}", task.id)));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn claim_next(&self, tiers: &[PriorityTier]) -> Result<Option<Task>, QueueError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write().await;

        for tier in tiers {
            let next = tasks
                .values()
                .filter(|t| t.priority == *tier && t.is_ready())
                .min_by(|a, b| within_tier_cmp(a, b))
                .map(|t| t.id);

            if let Some(id) = next {
                let task = tasks.get_mut(&id).ok_or(QueueError::TaskNotFound(id))?;
                task.status = TaskStatus::Processing;
                task.updated_at = now;
                debug!("Claimed task {} ({:?})", task.id, tier);
                return Ok(Some(task.clone()));
            }
        }

        Ok(None)
    }

    async fn complete(&self, id: Uuid, result: Value) -> Result<(), QueueError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(QueueError::TaskNotFound(id))?;

        if task.status.is_terminal() {
            if task.status == TaskStatus::DeadLetter {
                warn!("Ignoring completion of dead-lettered task {}", id);
            }
            return Ok(());
        }

        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn retry(
        &self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<RetryDisposition, QueueError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(QueueError::TaskNotFound(id))?;

        task.attempts += 1;
        task.last_error = Some(error.to_string());
        task.updated_at = Utc::now();

        if task.can_retry() {
            task.status = TaskStatus::Pending;
            task.scheduled_at = Some(retry_at);
            Ok(RetryDisposition::Scheduled(retry_at))
        } else {
            task.status = TaskStatus::DeadLetter;
            task.scheduled_at = None;
            Ok(RetryDisposition::DeadLettered)
        }
    }

    async fn dead_letter(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(QueueError::TaskNotFound(id))?;

        if task.status == TaskStatus::DeadLetter {
            return Ok(());
        }

        task.status = TaskStatus::DeadLetter;
        task.last_error = Some(error.to_string());
        task.scheduled_at = None;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Task, QueueError> {
        let tasks = self.tasks.read().await;
        tasks.get(&id).cloned().ok_or(QueueError::TaskNotFound(id))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let tasks = self.tasks.read().await;
        let mut stats = QueueStats::default();
        for task in tasks.values() {
            stats.count(task.status, 1);
        }
        Ok(stats)
    }

    async fn dead_letter_tasks(&self) -> Result<Vec<Task>, QueueError> {
        let tasks = self.tasks.read().await;
        let mut dead: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::DeadLetter)
            .cloned()
            .collect();
        dead.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(dead)
    }

    async fn reclaim_processing(&self) -> Result<u64, QueueError> {
        let mut tasks = self.tasks.write().await;
        let mut reclaimed = 0;
        for task in tasks.values_mut() {
            if task.status == TaskStatus::Processing {
                warn!("Reclaiming task {} stranded in processing", task.id);
                task.status = TaskStatus::Pending;
                task.updated_at = Utc::now();
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TIER_PRECEDENCE;
    use serde_json::json;
    use std::sync::Arc;

    fn task(task_type: &str) -> Task {
        Task::new(task_type, json!(null)).with_max_attempts(3)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryTaskStore::new();
        let t = task("pdf_extract");

        store.insert(&t).await.unwrap();

        let loaded = store.get(t.id).await.unwrap();
        assert_eq!(loaded.task_type, "pdf_extract");
        assert_eq!(loaded.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_insert_rejects_empty_type() {
        let store = MemoryTaskStore::new();
        let t = Task::new("", json!(null)).with_max_attempts(3);

        let result = store.insert(&t).await;
        assert!(matches!(result, Err(QueueError::Validation(_))));
    }

    #[tokio::test]
    async fn test_insert_rejects_zero_attempts() {
        let store = MemoryTaskStore::new();
        let t = Task::new("pdf_extract", json!(null));

        let result = store.insert(&t).await;
        assert!(matches!(result, Err(QueueError::Validation(_))));
    }

    #[tokio::test]
    async fn test_get_unknown_task() {
        let store = MemoryTaskStore::new();
        let result = store.get(Uuid::new_v4()).await;
        assert!(matches!(result, Err(QueueError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_claim_marks_processing() {
        let store = MemoryTaskStore::new();
        let t = task("pdf_extract");
        store.insert(&t).await.unwrap();

        let claimed = store.claim_next(&TIER_PRECEDENCE).await.unwrap().unwrap();
        assert_eq!(claimed.id, t.id);
        assert_eq!(claimed.status, TaskStatus::Processing);

        // Already claimed; nothing left.
        assert!(store.claim_next(&TIER_PRECEDENCE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_tier_precedence() {
        let store = MemoryTaskStore::new();
        let normal = task("a");
        let high = task("b").with_priority(PriorityTier::High);
        store.insert(&normal).await.unwrap();
        store.insert(&high).await.unwrap();

        let first = store.claim_next(&TIER_PRECEDENCE).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);

        let second = store.claim_next(&TIER_PRECEDENCE).await.unwrap().unwrap();
        assert_eq!(second.id, normal.id);
    }

    #[tokio::test]
    async fn test_claim_weight_then_fifo() {
        let store = MemoryTaskStore::new();
        let light = task("a");
        let mut heavy = task("b").with_weight(5);
        heavy.created_at = light.created_at + chrono::Duration::seconds(1);
        store.insert(&light).await.unwrap();
        store.insert(&heavy).await.unwrap();

        let first = store.claim_next(&TIER_PRECEDENCE).await.unwrap().unwrap();
        assert_eq!(first.id, heavy.id);
    }

    #[tokio::test]
    async fn test_claim_skips_deferred_tasks() {
        let store = MemoryTaskStore::new();
        let t = task("a").with_scheduled_at(Utc::now() + chrono::Duration::hours(1));
        store.insert(&t).await.unwrap();

        assert!(store.claim_next(&TIER_PRECEDENCE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_mutually_exclusive() {
        let store = Arc::new(MemoryTaskStore::new());
        let t = task("a");
        store.insert(&t).await.unwrap();

        let (a, b) = tokio::join!(
            store.claim_next(&TIER_PRECEDENCE),
            store.claim_next(&TIER_PRECEDENCE),
        );
        let claims = [a.unwrap(), b.unwrap()];
        assert_eq!(claims.iter().filter(|c| c.is_some()).count(), 1);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let store = MemoryTaskStore::new();
        let t = task("a");
        store.insert(&t).await.unwrap();
        store.claim_next(&TIER_PRECEDENCE).await.unwrap();

        store.complete(t.id, json!({"ok": true})).await.unwrap();
        store.complete(t.id, json!({"ok": false})).await.unwrap();

        let loaded = store.get(t.id).await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_complete_unknown_task() {
        let store = MemoryTaskStore::new();
        let result = store.complete(Uuid::new_v4(), json!(null)).await;
        assert!(matches!(result, Err(QueueError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_retry_until_dead_letter() {
        let store = MemoryTaskStore::new();
        let t = task("a");
        store.insert(&t).await.unwrap();

        let past = Utc::now() - chrono::Duration::seconds(1);
        store.claim_next(&TIER_PRECEDENCE).await.unwrap();
        assert!(matches!(
            store.retry(t.id, "boom", past).await.unwrap(),
            RetryDisposition::Scheduled(_)
        ));

        store.claim_next(&TIER_PRECEDENCE).await.unwrap();
        assert!(matches!(
            store.retry(t.id, "boom", past).await.unwrap(),
            RetryDisposition::Scheduled(_)
        ));

        store.claim_next(&TIER_PRECEDENCE).await.unwrap();
        assert_eq!(
            store.retry(t.id, "boom", past).await.unwrap(),
            RetryDisposition::DeadLettered
        );

        let loaded = store.get(t.id).await.unwrap();
        assert_eq!(loaded.status, TaskStatus::DeadLetter);
        assert_eq!(loaded.attempts, 3);
        assert_eq!(loaded.last_error.as_deref(), Some("boom"));

        // Dead-lettered tasks are never claimed again.
        assert!(store.claim_next(&TIER_PRECEDENCE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retried_task_waits_for_backoff() {
        let store = MemoryTaskStore::new();
        let t = task("a");
        store.insert(&t).await.unwrap();
        store.claim_next(&TIER_PRECEDENCE).await.unwrap();

        let future = Utc::now() + chrono::Duration::hours(1);
        store.retry(t.id, "boom", future).await.unwrap();

        assert!(store.claim_next(&TIER_PRECEDENCE).await.unwrap().is_none());
        assert_eq!(store.get(t.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_dead_letter_is_forced_and_idempotent() {
        let store = MemoryTaskStore::new();
        let t = task("a");
        store.insert(&t).await.unwrap();
        store.claim_next(&TIER_PRECEDENCE).await.unwrap();

        store.dead_letter(t.id, "no handler").await.unwrap();
        store.dead_letter(t.id, "again").await.unwrap();

        let loaded = store.get(t.id).await.unwrap();
        assert_eq!(loaded.status, TaskStatus::DeadLetter);
        assert_eq!(loaded.last_error.as_deref(), Some("no handler"));
        assert_eq!(loaded.attempts, 0);
    }

    #[tokio::test]
    async fn test_stats_counts_by_status() {
        let store = MemoryTaskStore::new();
        for _ in 0..3 {
            store.insert(&task("a")).await.unwrap();
        }
        let claimed = store.claim_next(&TIER_PRECEDENCE).await.unwrap().unwrap();
        store.complete(claimed.id, json!(null)).await.unwrap();
        store.claim_next(&TIER_PRECEDENCE).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.dead_letter, 0);
        assert_eq!(stats.total, 3);
    }

    #[tokio::test]
    async fn test_reclaim_processing() {
        let store = MemoryTaskStore::new();
        let t = task("a");
        store.insert(&t).await.unwrap();
        store.claim_next(&TIER_PRECEDENCE).await.unwrap();

        let reclaimed = store.reclaim_processing().await.unwrap();
        assert_eq!(reclaimed, 1);

        let loaded = store.get(t.id).await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.attempts, 0);
    }

    #[tokio::test]
    async fn test_dead_letter_listing() {
        let store = MemoryTaskStore::new();
        let t = task("a");
        store.insert(&t).await.unwrap();
        store.claim_next(&TIER_PRECEDENCE).await.unwrap();
        store.dead_letter(t.id, "no handler").await.unwrap();

        let dead = store.dead_letter_tasks().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, t.id);
    }
}
