//! Client interface for submitting tasks to the queue

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::config::StoreConfig;
use crate::error::TaskResult;
use crate::keys::KeyNamespace;
use crate::redis_backend::RedisBackend;
use crate::queue::TaskQueue;
use crate::scheduler::DelayedScheduler;
use crate::task::{to_task_data, TaskKey};

/// Delay used by [`TaskClient::delay_unique_default`]
pub const DEFAULT_UNIQUE_DELAY: Duration = Duration::from_secs(10);

/// Client for submitting tasks to the distributed task queue
#[derive(Clone)]
pub struct TaskClient {
    queue: TaskQueue,
    scheduler: DelayedScheduler,
}

impl TaskClient {
    /// Create a client on top of an existing store handle
    pub fn new(backend: Arc<dyn Backend>, keys: &KeyNamespace) -> Self {
        let queue = TaskQueue::new(backend.clone(), keys);
        let scheduler = DelayedScheduler::new(backend, queue.clone(), keys);
        Self { queue, scheduler }
    }

    /// Connect to Redis with the given settings
    pub async fn connect(config: &StoreConfig) -> TaskResult<Self> {
        let backend = RedisBackend::connect(config).await?;
        Ok(Self::new(
            Arc::new(backend),
            &KeyNamespace::new(config.key_prefix.clone()),
        ))
    }

    /// Enqueue a task behind everything already waiting.
    ///
    /// `args` must serialize to a JSON object (or unit/null for no arguments).
    pub async fn create<T>(&self, task_type: &str, args: &T) -> TaskResult<TaskKey>
    where
        T: Serialize + ?Sized,
    {
        self.queue
            .enqueue_normal(task_type, to_task_data(args)?)
            .await
    }

    /// Enqueue a task ahead of everything already waiting
    pub async fn prioritize<T>(&self, task_type: &str, args: &T) -> TaskResult<TaskKey>
    where
        T: Serialize + ?Sized,
    {
        self.queue
            .enqueue_priority(task_type, to_task_data(args)?)
            .await
    }

    /// Schedule a task to run after `delay`, merged with any pending request
    /// for the same `identifier`. Returns the unix time it becomes due.
    pub async fn delay_unique<T>(
        &self,
        task_type: &str,
        identifier: &str,
        args: &T,
        delay: Duration,
    ) -> TaskResult<f64>
    where
        T: Serialize + ?Sized,
    {
        self.scheduler
            .delay_unique(task_type, identifier, to_task_data(args)?, delay)
            .await
    }

    /// [`TaskClient::delay_unique`] with [`DEFAULT_UNIQUE_DELAY`]
    pub async fn delay_unique_default<T>(
        &self,
        task_type: &str,
        identifier: &str,
        args: &T,
    ) -> TaskResult<f64>
    where
        T: Serialize + ?Sized,
    {
        self.delay_unique(task_type, identifier, args, DEFAULT_UNIQUE_DELAY)
            .await
    }

    /// Submit multiple tasks of one type at once
    pub async fn create_batch<T>(&self, task_type: &str, batch: &[T]) -> TaskResult<Vec<TaskKey>>
    where
        T: Serialize,
    {
        let mut keys = Vec::with_capacity(batch.len());

        for args in batch {
            keys.push(self.create(task_type, args).await?);
        }

        Ok(keys)
    }

    /// Tasks waiting in the regular queue
    pub async fn backlog(&self) -> TaskResult<u64> {
        self.queue.len().await
    }

    /// Delayed tasks not yet promoted
    pub async fn pending_delayed(&self) -> TaskResult<u64> {
        self.scheduler.pending().await
    }

    /// Get access to the underlying queue for advanced operations
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn scheduler(&self) -> &DelayedScheduler {
        &self.scheduler
    }
}
