//! Named mutual-exclusion locks in the shared store
//!
//! A lock is a string key whose value identifies the holder. Acquisition
//! spins on SET NX with a short fixed interval; release deletes the key only
//! if it still holds the caller's identifier, so a holder whose lock was
//! taken over after a timeout cannot release somebody else's lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{Backend, CompareDelete};
use crate::error::{TaskError, TaskResult};
use crate::keys::KeyNamespace;

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Pause between SET NX attempts
    pub retry_interval: Duration,
    /// Optimistic release attempts before giving up with `LockContended`;
    /// zero is treated as one
    pub release_max_attempts: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(1),
            release_max_attempts: 32,
        }
    }
}

/// Holder identifier returned by a successful acquire
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LockToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn Backend>,
    keys: KeyNamespace,
    config: LockConfig,
}

impl LockManager {
    pub fn new(backend: Arc<dyn Backend>, keys: KeyNamespace) -> Self {
        Self::with_config(backend, keys, LockConfig::default())
    }

    pub fn with_config(backend: Arc<dyn Backend>, keys: KeyNamespace, config: LockConfig) -> Self {
        Self {
            backend,
            keys,
            config,
        }
    }

    /// Try to take `name` until `timeout` elapses. `None` means not acquired.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> TaskResult<Option<LockToken>> {
        let key = self.keys.lock(name);
        let token = LockToken::generate();
        let deadline = Instant::now() + timeout;

        loop {
            if self.backend.set_if_absent(&key, token.as_str()).await? {
                debug!("Acquired lock {} as {}", name, token);
                return Ok(Some(token));
            }
            if Instant::now() >= deadline {
                debug!("Timed out acquiring lock {}", name);
                return Ok(None);
            }
            sleep(self.config.retry_interval).await;
        }
    }

    /// Release `name` if `token` still holds it.
    ///
    /// Returns `Ok(false)` without touching the key when the lock is held by
    /// someone else or no longer exists.
    pub async fn release(&self, name: &str, token: &LockToken) -> TaskResult<bool> {
        let key = self.keys.lock(name);
        let max_attempts = self.config.release_max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.backend.delete_if_equals(&key, token.as_str()).await? {
                CompareDelete::Deleted => {
                    debug!("Released lock {}", name);
                    return Ok(true);
                }
                CompareDelete::Mismatch => {
                    warn!("Couldn't release lock {} (not matching identifier)", name);
                    return Ok(false);
                }
                CompareDelete::Contended => {
                    debug!("Release of {} contended (attempt {})", name, attempt);
                }
            }
        }

        Err(TaskError::LockContended {
            name: name.to_string(),
            attempts: max_attempts,
        })
    }

    /// Current holder of `name`, if any
    pub async fn holder(&self, name: &str) -> TaskResult<Option<LockToken>> {
        Ok(self.backend.get(&self.keys.lock(name)).await?.map(LockToken::from))
    }
}
