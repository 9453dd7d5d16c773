//! Immediate task list

use std::sync::Arc;
use tracing::{debug, error};

use crate::backend::Backend;
use crate::error::TaskResult;
use crate::keys::KeyNamespace;
use crate::task::{TaskData, TaskEnvelope, TaskKey};

/// Redis list of task envelopes.
///
/// Normal tasks are pushed on the head and consumed from the tail, so they
/// come out in arrival order. Prioritized tasks are pushed on the tail and
/// become the very next item to be consumed.
#[derive(Clone)]
pub struct TaskQueue {
    backend: Arc<dyn Backend>,
    key: String,
}

impl TaskQueue {
    pub fn new(backend: Arc<dyn Backend>, keys: &KeyNamespace) -> Self {
        Self {
            backend,
            key: keys.regular_tasks(),
        }
    }

    /// Append a task behind the current backlog
    pub async fn enqueue_normal(&self, task_type: &str, data: TaskData) -> TaskResult<TaskKey> {
        let envelope = TaskEnvelope::new(task_type, data);
        self.backend.push_head(&self.key, &envelope.to_json()?).await?;

        debug!("Queued task {} ({})", envelope.key, task_type);
        Ok(envelope.key)
    }

    /// Put a task in front of the backlog so it is dequeued next
    pub async fn enqueue_priority(&self, task_type: &str, data: TaskData) -> TaskResult<TaskKey> {
        let envelope = TaskEnvelope::new(task_type, data);
        self.backend.push_tail(&self.key, &envelope.to_json()?).await?;

        debug!("Queued priority task {} ({})", envelope.key, task_type);
        Ok(envelope.key)
    }

    /// Take the next task, or `None` when the list is empty.
    ///
    /// The pop is a single atomic command, so two consumers can never receive
    /// the same envelope; a consumer that loses the race simply sees `None`.
    /// An undecodable payload has already been removed from the list when the
    /// error is returned.
    pub async fn dequeue(&self) -> TaskResult<Option<TaskEnvelope>> {
        let Some(raw) = self.backend.pop_tail(&self.key).await? else {
            return Ok(None);
        };

        match TaskEnvelope::from_json(&raw) {
            Ok(envelope) => {
                debug!("Dequeued task {} ({})", envelope.key, envelope.task_type);
                Ok(Some(envelope))
            }
            Err(e) => {
                error!("Dropping undecodable task payload {:?}: {}", raw, e);
                Err(e)
            }
        }
    }

    /// Number of tasks waiting
    pub async fn len(&self) -> TaskResult<u64> {
        self.backend.list_len(&self.key).await
    }

    pub async fn is_empty(&self) -> TaskResult<bool> {
        Ok(self.len().await? == 0)
    }
}
