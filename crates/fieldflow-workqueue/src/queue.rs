//! Public queue facade.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::callback::CallbackDispatcher;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::handler::{HandlerRegistry, TaskHandler};
use crate::metrics::{MetricsSnapshot, QueueMetrics};
use crate::sqlite::SqliteTaskStore;
use crate::store::{MemoryTaskStore, QueueStats, TaskStore};
use crate::task::Task;
use crate::worker::WorkerPool;

/// Durable, priority-ordered work queue with a concurrent worker pool.
///
/// The store is the single source of truth; the facade only composes
/// store, handler registry, worker pool, and callback dispatcher.
pub struct WorkQueue {
    config: QueueConfig,
    store: Arc<dyn TaskStore>,
    handlers: Arc<HandlerRegistry>,
    metrics: Arc<QueueMetrics>,
    pool: WorkerPool,
}

impl WorkQueue {
    /// Create a queue backed by the store the configuration names:
    /// SQLite when `db_path` is set, in-memory otherwise.
    pub async fn new(config: QueueConfig) -> Result<Self, QueueError> {
        let store: Arc<dyn TaskStore> = match &config.db_path {
            Some(path) => Arc::new(SqliteTaskStore::open(path).await?),
            None => Arc::new(MemoryTaskStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a queue on an explicit store.
    pub fn with_store(config: QueueConfig, store: Arc<dyn TaskStore>) -> Self {
        let handlers = Arc::new(HandlerRegistry::new());
        let metrics = Arc::new(QueueMetrics::new());
        let callbacks = Arc::new(CallbackDispatcher::new(config.callback_timeout()));
        let pool = WorkerPool::new(
            config.clone(),
            store.clone(),
            handlers.clone(),
            callbacks,
            metrics.clone(),
        );

        Self {
            config,
            store,
            handlers,
            metrics,
            pool,
        }
    }

    /// Register the handler for a task type.
    pub async fn register_handler(
        &self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) {
        self.handlers.register(task_type, handler).await;
    }

    /// Persist a new task and return its id.
    ///
    /// Tasks without an explicit attempt ceiling inherit the queue
    /// default.
    pub async fn enqueue(&self, mut task: Task) -> Result<Uuid, QueueError> {
        if task.max_attempts == 0 {
            task.max_attempts = self.config.default_max_attempts;
        }
        self.store.insert(&task).await?;

        debug!(
            "Enqueued task {} ({}, {:?}, weight {})",
            task.id, task.task_type, task.priority, task.weight
        );
        Ok(task.id)
    }

    /// Snapshot of a task's last durably committed state.
    pub async fn get_status(&self, id: Uuid) -> Result<Task, QueueError> {
        self.store.get(id).await
    }

    /// Counts by status.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.store.stats().await
    }

    /// All dead-lettered tasks, oldest first.
    pub async fn dead_letter_tasks(&self) -> Result<Vec<Task>, QueueError> {
        self.store.dead_letter_tasks().await
    }

    /// Worker-pool counters for the alerting consumer.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Reclaim tasks stranded in Processing by a previous run, then
    /// spawn the worker pool.
    pub async fn start(&self) -> Result<(), QueueError> {
        let reclaimed = self.store.reclaim_processing().await?;
        if reclaimed > 0 {
            warn!("Returned {} stranded tasks to pending before start", reclaimed);
        }

        self.pool.start(self.config.worker_count).await;
        info!("Work queue started");
        Ok(())
    }

    /// Stop claiming new tasks. With `wait`, block until each worker
    /// has finished its in-flight task and exited.
    pub async fn stop(&self, wait: bool) {
        self.pool.stop(wait).await;
        info!("Work queue stopped");
    }
}
