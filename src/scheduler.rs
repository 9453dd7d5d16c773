//! Delayed, deduplicated tasks
//!
//! A delayed task is two records: a member `[identifier, type]` in a sorted
//! set scored by its due time, and the merged payload under `identifier` in a
//! hash. Re-delaying the same identifier pushes the due time back and merges
//! the new arguments into the stored ones, so a burst of requests collapses
//! into a single task.
//!
//! Promotion moves due entries into the [`TaskQueue`]. Removing the sorted-set
//! member is the only point of contention: whichever caller removes it is the
//! sole promoter, everyone else backs off. If the promoter then fails to
//! enqueue, it puts the entry back with its original due time.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::error::{TaskError, TaskResult};
use crate::keys::KeyNamespace;
use crate::queue::TaskQueue;
use crate::task::{now_unix, TaskData, TaskKey};

/// What a single promotion attempt did
#[derive(Debug, Clone, PartialEq)]
pub enum PromoteOutcome {
    /// Nothing is scheduled
    Empty,
    /// The earliest entry is still in the future
    NotDue,
    /// Another promoter removed the entry first
    Raced,
    /// The entry was moved into the task queue
    Promoted {
        identifier: String,
        task_type: String,
        key: TaskKey,
    },
}

/// Earliest scheduled entry, as seen by [`DelayedScheduler::next_due`]
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledEntry {
    pub identifier: String,
    pub task_type: String,
    pub due_at: f64,
}

#[derive(Clone)]
pub struct DelayedScheduler {
    backend: Arc<dyn Backend>,
    queue: TaskQueue,
    schedule_key: String,
    data_key: String,
}

/// Deduplication token stored in the sorted set
fn schedule_member(identifier: &str, task_type: &str) -> TaskResult<String> {
    Ok(serde_json::to_string(&(identifier, task_type))?)
}

fn parse_member(member: &str) -> TaskResult<(String, String)> {
    Ok(serde_json::from_str(member)?)
}

impl DelayedScheduler {
    pub fn new(backend: Arc<dyn Backend>, queue: TaskQueue, keys: &KeyNamespace) -> Self {
        Self {
            backend,
            queue,
            schedule_key: keys.delayed_tasks(),
            data_key: keys.delayed_task_data(),
        }
    }

    /// Schedule `task_type` to run `delay` from now, coalescing with any
    /// pending request for the same identifier. Returns the new due time.
    pub async fn delay_unique(
        &self,
        task_type: &str,
        identifier: &str,
        data: TaskData,
        delay: Duration,
    ) -> TaskResult<f64> {
        self.delay_unique_at(now_unix(), task_type, identifier, data, delay)
            .await
    }

    pub async fn delay_unique_at(
        &self,
        now: f64,
        task_type: &str,
        identifier: &str,
        data: TaskData,
        delay: Duration,
    ) -> TaskResult<f64> {
        let merged = match self.backend.hash_get(&self.data_key, identifier).await? {
            Some(raw) => match serde_json::from_str::<Option<TaskData>>(&raw) {
                Ok(stored) => {
                    let mut stored = stored.unwrap_or_default();
                    stored.extend(data);
                    stored
                }
                Err(e) => {
                    warn!("Replacing unreadable delayed payload for {}: {}", identifier, e);
                    data
                }
            },
            None => data,
        };
        self.backend
            .hash_set(&self.data_key, identifier, &serde_json::to_string(&merged)?)
            .await?;

        let member = schedule_member(identifier, task_type)?;
        let due_at = now + delay.as_secs_f64();
        self.backend.sorted_remove(&self.schedule_key, &member).await?;
        self.backend
            .sorted_add(&self.schedule_key, &member, due_at)
            .await?;

        debug!("Delayed {} ({}) until {:.3}", identifier, task_type, due_at);
        Ok(due_at)
    }

    /// Whether the earliest scheduled entry is due
    pub async fn has_due_task(&self) -> TaskResult<bool> {
        self.has_due_task_at(now_unix()).await
    }

    pub async fn has_due_task_at(&self, now: f64) -> TaskResult<bool> {
        Ok(matches!(
            self.backend.sorted_first(&self.schedule_key).await?,
            Some((_, due_at)) if due_at <= now
        ))
    }

    /// Move the earliest due entry into the task queue, in front of the
    /// backlog when `prioritize` is set
    pub async fn promote_next(&self, prioritize: bool) -> TaskResult<PromoteOutcome> {
        self.promote_next_at(now_unix(), prioritize).await
    }

    pub async fn promote_next_at(&self, now: f64, prioritize: bool) -> TaskResult<PromoteOutcome> {
        let Some((member, due_at)) = self.backend.sorted_first(&self.schedule_key).await? else {
            return Ok(PromoteOutcome::Empty);
        };
        if due_at > now {
            return Ok(PromoteOutcome::NotDue);
        }

        if !self.backend.sorted_remove(&self.schedule_key, &member).await? {
            debug!("Delayed task {} was already picked up", member);
            return Ok(PromoteOutcome::Raced);
        }

        // From here on this caller owns the entry
        let (identifier, task_type) = parse_member(&member)?;

        let data = match self.backend.hash_get(&self.data_key, &identifier).await {
            Ok(Some(raw)) => match serde_json::from_str::<Option<TaskData>>(&raw) {
                Ok(data) => data.unwrap_or_default(),
                Err(e) => {
                    warn!(
                        "Unreadable payload for delayed task {} ({}); promoting without data: {}",
                        identifier, task_type, e
                    );
                    TaskData::new()
                }
            },
            Ok(None) => {
                warn!(
                    "No payload stored for delayed task {} ({}); promoting without data",
                    identifier, task_type
                );
                TaskData::new()
            }
            Err(e) => return Err(self.reschedule(&member, due_at, e).await),
        };

        let enqueued = if prioritize {
            self.queue.enqueue_priority(&task_type, data).await
        } else {
            self.queue.enqueue_normal(&task_type, data).await
        };
        let key = match enqueued {
            Ok(key) => key,
            Err(e) => return Err(self.reschedule(&member, due_at, e).await),
        };

        // Already queued, so a failed cleanup is only logged
        if let Err(e) = self.backend.hash_delete(&self.data_key, &identifier).await {
            warn!("Failed to clear payload of delayed task {}: {}", identifier, e);
        }

        info!("Promoted delayed task {} ({}) as {}", identifier, task_type, key);
        Ok(PromoteOutcome::Promoted {
            identifier,
            task_type,
            key,
        })
    }

    /// Put a claimed entry back so a later pass promotes it, then hand the
    /// original error back to the caller
    async fn reschedule(&self, member: &str, due_at: f64, cause: TaskError) -> TaskError {
        match self.backend.sorted_add(&self.schedule_key, member, due_at).await {
            Ok(()) => warn!("Promotion of {} failed, rescheduled: {}", member, cause),
            Err(e) => error!(
                "Promotion of {} failed ({}) and it could not be rescheduled: {}",
                member, cause, e
            ),
        }
        cause
    }

    /// Number of scheduled entries
    pub async fn pending(&self) -> TaskResult<u64> {
        self.backend.sorted_len(&self.schedule_key).await
    }

    /// Earliest scheduled entry, due or not
    pub async fn next_due(&self) -> TaskResult<Option<ScheduledEntry>> {
        let Some((member, due_at)) = self.backend.sorted_first(&self.schedule_key).await? else {
            return Ok(None);
        };
        let (identifier, task_type) = parse_member(&member)?;
        Ok(Some(ScheduledEntry {
            identifier,
            task_type,
            due_at,
        }))
    }

    /// Stored (merged) payload for an identifier
    pub async fn payload(&self, identifier: &str) -> TaskResult<Option<TaskData>> {
        match self.backend.hash_get(&self.data_key, identifier).await? {
            Some(raw) => Ok(Some(
                serde_json::from_str::<Option<TaskData>>(&raw)?.unwrap_or_default(),
            )),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CompareDelete;
    use crate::memory::MemoryBackend;
    use crate::task::to_task_data;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    const T0: f64 = 1_700_000_000.0;

    fn scheduler() -> (DelayedScheduler, TaskQueue) {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let keys = KeyNamespace::new("test");
        let queue = TaskQueue::new(backend.clone(), &keys);
        (DelayedScheduler::new(backend, queue.clone(), &keys), queue)
    }

    fn data(value: serde_json::Value) -> TaskData {
        to_task_data(&value).unwrap()
    }

    #[tokio::test]
    async fn repeated_delays_coalesce_and_merge() {
        let (scheduler, _) = scheduler();
        scheduler
            .delay_unique_at(T0, "T", "x", data(json!({"a": 1})), Duration::from_secs(5))
            .await
            .unwrap();
        scheduler
            .delay_unique_at(T0 + 2.0, "T", "x", data(json!({"b": 2})), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(scheduler.pending().await.unwrap(), 1);
        let entry = scheduler.next_due().await.unwrap().unwrap();
        assert_eq!(entry.identifier, "x");
        assert_eq!(entry.task_type, "T");
        assert_eq!(entry.due_at, T0 + 7.0);
        assert_eq!(
            scheduler.payload("x").await.unwrap().unwrap(),
            data(json!({"a": 1, "b": 2}))
        );
    }

    #[tokio::test]
    async fn later_values_overwrite_earlier_keys() {
        let (scheduler, _) = scheduler();
        scheduler
            .delay_unique_at(T0, "T", "x", data(json!({"a": 1, "keep": true})), Duration::from_secs(1))
            .await
            .unwrap();
        scheduler
            .delay_unique_at(T0, "T", "x", data(json!({"a": 2})), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(
            scheduler.payload("x").await.unwrap().unwrap(),
            data(json!({"a": 2, "keep": true}))
        );
    }

    #[tokio::test]
    async fn due_time_gates_availability() {
        let (scheduler, _) = scheduler();
        assert!(!scheduler.has_due_task_at(T0).await.unwrap());

        scheduler
            .delay_unique_at(T0, "T", "x", TaskData::new(), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!scheduler.has_due_task_at(T0).await.unwrap());
        assert!(!scheduler.has_due_task_at(T0 + 4.9).await.unwrap());
        assert!(scheduler.has_due_task_at(T0 + 5.0).await.unwrap());
        assert_eq!(
            scheduler.promote_next_at(T0 + 1.0, true).await.unwrap(),
            PromoteOutcome::NotDue
        );
    }

    #[tokio::test]
    async fn promotion_moves_merged_payload_into_queue() {
        let (scheduler, queue) = scheduler();
        scheduler
            .delay_unique_at(T0, "reindex", "doc-1", data(json!({"a": 1})), Duration::from_secs(5))
            .await
            .unwrap();
        scheduler
            .delay_unique_at(T0, "reindex", "doc-1", data(json!({"b": 2})), Duration::from_secs(5))
            .await
            .unwrap();

        let outcome = scheduler.promote_next_at(T0 + 5.0, false).await.unwrap();
        assert!(matches!(outcome, PromoteOutcome::Promoted { ref identifier, .. } if identifier == "doc-1"));

        let envelope = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(envelope.task_type, "reindex");
        assert_eq!(envelope.data, data(json!({"a": 1, "b": 2})));

        assert_eq!(scheduler.pending().await.unwrap(), 0);
        assert!(scheduler.payload("doc-1").await.unwrap().is_none());
        assert_eq!(
            scheduler.promote_next_at(T0 + 5.0, false).await.unwrap(),
            PromoteOutcome::Empty
        );
    }

    #[tokio::test]
    async fn prioritized_promotion_jumps_the_backlog() {
        let (scheduler, queue) = scheduler();
        queue.enqueue_normal("backlog", TaskData::new()).await.unwrap();
        scheduler
            .delay_unique_at(T0, "urgent", "u", TaskData::new(), Duration::ZERO)
            .await
            .unwrap();

        scheduler.promote_next_at(T0, true).await.unwrap();
        assert_eq!(queue.dequeue().await.unwrap().unwrap().task_type, "urgent");
    }

    #[tokio::test]
    async fn concurrent_promoters_move_an_entry_once() {
        let (scheduler, queue) = scheduler();
        scheduler
            .delay_unique_at(T0, "T", "x", data(json!({"a": 1})), Duration::from_secs(1))
            .await
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.promote_next_at(T0 + 2.0, true).await })
            })
            .collect();

        let mut promoted = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                PromoteOutcome::Promoted { .. } => promoted += 1,
                PromoteOutcome::Raced | PromoteOutcome::Empty => {}
                PromoteOutcome::NotDue => panic!("entry should be due"),
            }
        }

        assert_eq!(promoted, 1);
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn different_types_for_one_identifier_are_separate_entries() {
        let (scheduler, queue) = scheduler();
        scheduler
            .delay_unique_at(T0, "A", "x", data(json!({"a": 1})), Duration::from_secs(1))
            .await
            .unwrap();
        scheduler
            .delay_unique_at(T0, "B", "x", data(json!({"b": 2})), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(scheduler.pending().await.unwrap(), 2);

        scheduler.promote_next_at(T0 + 3.0, false).await.unwrap();
        // The sibling finds the shared payload gone and still promotes
        scheduler.promote_next_at(T0 + 3.0, false).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.task_type, "A");
        assert_eq!(first.data, data(json!({"a": 1, "b": 2})));
        assert_eq!(second.task_type, "B");
        assert!(second.data.is_empty());
    }

    #[tokio::test]
    async fn failed_enqueue_puts_the_entry_back() {
        let backend = Arc::new(MemoryBackend::new());
        let keys = KeyNamespace::new("test");
        let queue = TaskQueue::new(backend.clone(), &keys);
        let scheduler = DelayedScheduler::new(backend.clone(), queue.clone(), &keys);
        scheduler
            .delay_unique_at(T0, "T", "x", data(json!({"a": 1})), Duration::from_secs(1))
            .await
            .unwrap();

        // A plain string under the queue key makes the push fail
        let queue_key = keys.regular_tasks();
        assert!(backend.set_if_absent(&queue_key, "blocked").await.unwrap());
        assert!(scheduler.promote_next_at(T0 + 2.0, false).await.is_err());

        assert_eq!(scheduler.pending().await.unwrap(), 1);
        assert_eq!(scheduler.next_due().await.unwrap().unwrap().due_at, T0 + 1.0);
        assert_eq!(
            scheduler.payload("x").await.unwrap(),
            Some(data(json!({"a": 1})))
        );

        assert_eq!(
            backend.delete_if_equals(&queue_key, "blocked").await.unwrap(),
            CompareDelete::Deleted
        );
        let outcome = scheduler.promote_next_at(T0 + 2.0, false).await.unwrap();
        assert!(matches!(outcome, PromoteOutcome::Promoted { .. }));

        let envelope = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(envelope.data, data(json!({"a": 1})));
        assert!(scheduler.payload("x").await.unwrap().is_none());
        assert_eq!(scheduler.pending().await.unwrap(), 0);
    }

    /// Store where some other promoter always removes the member first
    struct LosesEveryRemove {
        inner: MemoryBackend,
    }

    #[async_trait]
    impl Backend for LosesEveryRemove {
        async fn ping(&self) -> TaskResult<()> {
            self.inner.ping().await
        }
        async fn push_head(&self, key: &str, value: &str) -> TaskResult<()> {
            self.inner.push_head(key, value).await
        }
        async fn push_tail(&self, key: &str, value: &str) -> TaskResult<()> {
            self.inner.push_tail(key, value).await
        }
        async fn pop_tail(&self, key: &str) -> TaskResult<Option<String>> {
            self.inner.pop_tail(key).await
        }
        async fn list_len(&self, key: &str) -> TaskResult<u64> {
            self.inner.list_len(key).await
        }
        async fn sorted_add(&self, key: &str, member: &str, score: f64) -> TaskResult<()> {
            self.inner.sorted_add(key, member, score).await
        }
        async fn sorted_remove(&self, _: &str, _: &str) -> TaskResult<bool> {
            Ok(false)
        }
        async fn sorted_first(&self, key: &str) -> TaskResult<Option<(String, f64)>> {
            self.inner.sorted_first(key).await
        }
        async fn sorted_len(&self, key: &str) -> TaskResult<u64> {
            self.inner.sorted_len(key).await
        }
        async fn hash_get(&self, key: &str, field: &str) -> TaskResult<Option<String>> {
            self.inner.hash_get(key, field).await
        }
        async fn hash_set(&self, key: &str, field: &str, value: &str) -> TaskResult<()> {
            self.inner.hash_set(key, field, value).await
        }
        async fn hash_delete(&self, key: &str, field: &str) -> TaskResult<bool> {
            self.inner.hash_delete(key, field).await
        }
        async fn hash_get_all(&self, key: &str) -> TaskResult<HashMap<String, String>> {
            self.inner.hash_get_all(key).await
        }
        async fn hash_len(&self, key: &str) -> TaskResult<u64> {
            self.inner.hash_len(key).await
        }
        async fn get(&self, key: &str) -> TaskResult<Option<String>> {
            self.inner.get(key).await
        }
        async fn set_if_absent(&self, key: &str, value: &str) -> TaskResult<bool> {
            self.inner.set_if_absent(key, value).await
        }
        async fn delete_if_equals(&self, key: &str, expected: &str) -> TaskResult<CompareDelete> {
            self.inner.delete_if_equals(key, expected).await
        }
    }

    #[tokio::test]
    async fn losing_the_remove_race_leaves_everything_in_place() {
        let backend: Arc<dyn Backend> = Arc::new(LosesEveryRemove {
            inner: MemoryBackend::new(),
        });
        let keys = KeyNamespace::new("test");
        let queue = TaskQueue::new(backend.clone(), &keys);
        let scheduler = DelayedScheduler::new(backend, queue.clone(), &keys);
        scheduler
            .delay_unique_at(T0, "T", "x", data(json!({"a": 1})), Duration::from_secs(1))
            .await
            .unwrap();

        assert!(scheduler.has_due_task_at(T0 + 2.0).await.unwrap());
        assert_eq!(
            scheduler.promote_next_at(T0 + 2.0, true).await.unwrap(),
            PromoteOutcome::Raced
        );

        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(scheduler.pending().await.unwrap(), 1);
        assert_eq!(
            scheduler.payload("x").await.unwrap(),
            Some(data(json!({"a": 1})))
        );
    }
}
