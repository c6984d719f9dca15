//! Worker pool for claim-execute-resolve cycles.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::callback::CallbackDispatcher;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::handler::HandlerRegistry;
use crate::metrics::QueueMetrics;
use crate::retry::RetryPolicy;
use crate::scheduler::TIER_PRECEDENCE;
use crate::store::{RetryDisposition, TaskStore};
use crate::task::{Task, TaskStatus};

/// A single execution unit in the pool.
pub struct Worker {
    id: u32,
    store: Arc<dyn TaskStore>,
    handlers: Arc<HandlerRegistry>,
    callbacks: Arc<CallbackDispatcher>,
    metrics: Arc<QueueMetrics>,
    retry_policy: RetryPolicy,
}

impl Worker {
    /// Create a new worker.
    pub fn new(
        id: u32,
        store: Arc<dyn TaskStore>,
        handlers: Arc<HandlerRegistry>,
        callbacks: Arc<CallbackDispatcher>,
        metrics: Arc<QueueMetrics>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            id,
            store,
            handlers,
            callbacks,
            metrics,
            retry_policy,
        }
    }

    /// Claim loop: runs until the shutdown signal arrives. A claimed
    /// task is always resolved before the signal is honored.
    pub async fn run(self, poll_interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        debug!("Worker {} started", self.id);

        loop {
            match self.store.claim_next(&TIER_PRECEDENCE).await {
                Ok(Some(task)) => {
                    self.execute(task).await;

                    match shutdown.try_recv() {
                        Err(broadcast::error::TryRecvError::Empty) => {}
                        _ => break,
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
                Err(e) => {
                    // The source of truth is unreliable; stop claiming
                    // rather than silently skipping tasks.
                    error!("Worker {} halting on store failure: {}", self.id, e);
                    break;
                }
            }
        }

        debug!("Worker {} stopped", self.id);
    }

    /// One claim-execute-resolve cycle.
    pub async fn execute(&self, task: Task) {
        self.metrics.record_claimed(task.id);
        debug!(
            "Worker {} processing task {} ({})",
            self.id, task.id, task.task_type
        );

        let Some(handler) = self.handlers.get(&task.task_type).await else {
            let err = QueueError::HandlerNotFound(task.task_type.clone());
            warn!("Worker {}: {}", self.id, err);
            self.resolve_dead_letter(task, &err.to_string()).await;
            return;
        };

        match handler.handle(&task).await {
            Ok(result) => self.resolve_completed(task, result).await,
            Err(e) => self.resolve_failed(task, &e.to_string()).await,
        }
    }

    async fn resolve_completed(&self, mut task: Task, result: Value) {
        if let Err(e) = self.store.complete(task.id, result.clone()).await {
            error!(
                "Worker {} could not record completion of task {}: {}",
                self.id, task.id, e
            );
            return;
        }

        self.metrics.record_completed(task.id);
        debug!("Worker {} completed task {}", self.id, task.id);

        task.status = TaskStatus::Completed;
        task.result = Some(result);
        self.notify(&task).await;
    }

    async fn resolve_failed(&self, mut task: Task, error_msg: &str) {
        let failed_attempts = task.attempts + 1;
        warn!(
            "Worker {}: task {} attempt {}/{} failed: {}",
            self.id, task.id, failed_attempts, task.max_attempts, error_msg
        );

        let delay = self.retry_policy.delay_for(failed_attempts);
        let retry_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);

        match self.store.retry(task.id, error_msg, retry_at).await {
            Ok(RetryDisposition::Scheduled(at)) => {
                self.metrics.record_retried(task.id);
                debug!("Worker {} rescheduled task {} for {}", self.id, task.id, at);
            }
            Ok(RetryDisposition::DeadLettered) => {
                self.metrics.record_dead_lettered(task.id);
                warn!(
                    "Worker {}: task {} exhausted {} attempts, dead-lettered",
                    self.id, task.id, task.max_attempts
                );

                task.status = TaskStatus::DeadLetter;
                task.attempts = task.max_attempts;
                task.last_error = Some(error_msg.to_string());
                self.notify(&task).await;
            }
            Err(e) => {
                error!(
                    "Worker {} could not record failed attempt of task {}: {}",
                    self.id, task.id, e
                );
            }
        }
    }

    async fn resolve_dead_letter(&self, mut task: Task, error_msg: &str) {
        if let Err(e) = self.store.dead_letter(task.id, error_msg).await {
            error!(
                "Worker {} could not dead-letter task {}: {}",
                self.id, task.id, e
            );
            return;
        }

        self.metrics.record_dead_lettered(task.id);
        task.status = TaskStatus::DeadLetter;
        task.last_error = Some(error_msg.to_string());
        self.notify(&task).await;
    }

    async fn notify(&self, task: &Task) {
        if let Err(e) = self.callbacks.dispatch(task).await {
            warn!("{}", e);
        }
    }
}

/// Fixed-size set of workers sharing one store and handler registry.
pub struct WorkerPool {
    config: QueueConfig,
    store: Arc<dyn TaskStore>,
    handlers: Arc<HandlerRegistry>,
    callbacks: Arc<CallbackDispatcher>,
    metrics: Arc<QueueMetrics>,
    shutdown_tx: broadcast::Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a stopped pool.
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn TaskStore>,
        handlers: Arc<HandlerRegistry>,
        callbacks: Arc<CallbackDispatcher>,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            store,
            handlers,
            callbacks,
            metrics,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `worker_count` workers. A second call while running is a
    /// no-op.
    pub async fn start(&self, worker_count: u32) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            warn!("Worker pool already started");
            return;
        }

        for id in 0..worker_count {
            let worker = Worker::new(
                id,
                self.store.clone(),
                self.handlers.clone(),
                self.callbacks.clone(),
                self.metrics.clone(),
                self.config.retry.clone(),
            );
            let poll_interval = self.config.poll_interval();
            let shutdown_rx = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(worker.run(poll_interval, shutdown_rx)));
        }

        info!("Worker pool started with {} workers", worker_count);
    }

    /// Signal shutdown. With `wait`, block until every worker finishes
    /// its in-flight task and exits; without, workers drain on their
    /// own time.
    pub async fn stop(&self, wait: bool) {
        let mut workers = self.workers.lock().await;
        if workers.is_empty() {
            return;
        }

        let _ = self.shutdown_tx.send(());

        if wait {
            for handle in workers.drain(..) {
                if let Err(e) = handle.await {
                    error!("Worker task failed to join: {}", e);
                }
            }
        } else {
            workers.clear();
        }

        info!("Worker pool stopped");
    }

    /// Number of workers spawned and not yet joined.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }
}
