//! Task handlers and the type-keyed registry.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::QueueError;
use crate::task::Task;

/// Work performed for one task type.
///
/// Handlers run outside every queue lock and may execute fully in
/// parallel across workers. A returned error counts as a failed attempt
/// and is retried until the task's budget runs out, so handlers must be
/// idempotent under at-least-once delivery.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the task, returning the result recorded on completion.
    async fn handle(&self, task: &Task) -> Result<Value, QueueError>;
}

/// Registry mapping task types to their handlers.
///
/// Populated at startup by the external modules that own each task type
/// (work-order extraction, portal allocation, technician notification).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a task type, replacing any previous one.
    pub async fn register(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        debug!("Registered handler for task type '{}'", task_type);
        self.handlers.write().await.insert(task_type, handler);
    }

    /// Look up the handler for a task type.
    pub async fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(task_type).cloned()
    }

    /// Registered task types, for diagnostics.
    pub async fn task_types(&self) -> Vec<String> {
        self.handlers.read().await.keys().cloned().collect()
    }
}
