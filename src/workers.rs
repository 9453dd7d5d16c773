//! Worker liveness registry
//!
//! Every running engine keeps a signature under its own id in a shared hash
//! and, on each heartbeat, evicts any peer whose last heartbeat is older than
//! the liveness timeout. There is no coordinator: several processes may evict
//! the same stale entry, which only costs a redundant HDEL.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::error::TaskResult;
use crate::keys::KeyNamespace;
use crate::task::now_unix;

/// Unique identifier for workers
pub type WorkerId = Uuid;

/// What a worker reports about itself on every heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSignature {
    /// Unix seconds of the last heartbeat
    pub last_heartbeat: f64,
    /// Tasks completed since the worker last went idle
    pub tasks_completed: u64,
    /// Unix seconds of the last task activity
    pub last_action_time: f64,
}

impl WorkerSignature {
    pub fn is_stale(&self, now: f64, timeout: Duration) -> bool {
        now - self.last_heartbeat > timeout.as_secs_f64()
    }
}

#[derive(Clone)]
pub struct WorkerRegistry {
    backend: Arc<dyn Backend>,
    key: String,
}

impl WorkerRegistry {
    /// `registration_key` is the logical name of the shared hash
    pub fn new(backend: Arc<dyn Backend>, keys: &KeyNamespace, registration_key: &str) -> Self {
        Self {
            backend,
            key: keys.key(registration_key),
        }
    }

    /// Upsert this worker's signature stamped with the current time
    pub async fn heartbeat(
        &self,
        worker_id: WorkerId,
        tasks_completed: u64,
        last_action_time: f64,
    ) -> TaskResult<WorkerSignature> {
        let signature = WorkerSignature {
            last_heartbeat: now_unix(),
            tasks_completed,
            last_action_time,
        };
        self.register(worker_id, &signature).await?;
        Ok(signature)
    }

    /// Store a signature exactly as given
    pub async fn register(&self, worker_id: WorkerId, signature: &WorkerSignature) -> TaskResult<()> {
        self.backend
            .hash_set(&self.key, &worker_id.to_string(), &serde_json::to_string(signature)?)
            .await
    }

    /// Evict every worker whose heartbeat is older than `timeout`
    pub async fn sweep(&self, timeout: Duration) -> TaskResult<Vec<String>> {
        self.sweep_at(now_unix(), timeout).await
    }

    pub async fn sweep_at(&self, now: f64, timeout: Duration) -> TaskResult<Vec<String>> {
        let entries = self.backend.hash_get_all(&self.key).await?;
        let mut evicted = Vec::new();

        for (worker_id, raw) in entries {
            let stale = match serde_json::from_str::<WorkerSignature>(&raw) {
                Ok(signature) => signature.is_stale(now, timeout),
                Err(e) => {
                    warn!("Unreadable signature for worker {}: {}", worker_id, e);
                    true
                }
            };
            if !stale {
                continue;
            }

            // A peer may have evicted it already; that is fine
            if self.backend.hash_delete(&self.key, &worker_id).await? {
                warn!("Worker timed out: {}", worker_id);
            } else {
                debug!("Worker {} already evicted by a peer", worker_id);
            }
            evicted.push(worker_id);
        }

        Ok(evicted)
    }

    /// Remove a worker's entry, e.g. on graceful shutdown
    pub async fn deregister(&self, worker_id: WorkerId) -> TaskResult<bool> {
        self.backend.hash_delete(&self.key, &worker_id.to_string()).await
    }

    /// All readable signatures currently registered
    pub async fn workers(&self) -> TaskResult<HashMap<String, WorkerSignature>> {
        let entries = self.backend.hash_get_all(&self.key).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(worker_id, raw)| {
                serde_json::from_str(&raw)
                    .ok()
                    .map(|signature| (worker_id, signature))
            })
            .collect())
    }

    pub async fn count(&self) -> TaskResult<u64> {
        self.backend.hash_len(&self.key).await
    }
}
