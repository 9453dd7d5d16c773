//! Store primitives shared by every component
//!
//! Each method maps onto one Redis command (or one optimistic transaction for
//! [`Backend::delete_if_equals`]) and is atomic at the store level. Components
//! hold an `Arc<dyn Backend>` handed to them at construction.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::TaskResult;

/// Result of a single optimistic compare-and-delete attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareDelete {
    /// The key held the expected value and was deleted
    Deleted,
    /// The key was missing or held another value; nothing was changed
    Mismatch,
    /// A concurrent writer touched the key between the read and the delete
    Contended,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Round-trip to verify the store is reachable
    async fn ping(&self) -> TaskResult<()>;

    /// LPUSH
    async fn push_head(&self, key: &str, value: &str) -> TaskResult<()>;

    /// RPUSH
    async fn push_tail(&self, key: &str, value: &str) -> TaskResult<()>;

    /// RPOP; `None` when the list is empty or missing
    async fn pop_tail(&self, key: &str) -> TaskResult<Option<String>>;

    async fn list_len(&self, key: &str) -> TaskResult<u64>;

    /// ZADD, replacing the score of an existing member
    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> TaskResult<()>;

    /// ZREM; `true` only for the caller that actually removed the member
    async fn sorted_remove(&self, key: &str, member: &str) -> TaskResult<bool>;

    /// Lowest-scored member with its score
    async fn sorted_first(&self, key: &str) -> TaskResult<Option<(String, f64)>>;

    async fn sorted_len(&self, key: &str) -> TaskResult<u64>;

    async fn hash_get(&self, key: &str, field: &str) -> TaskResult<Option<String>>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> TaskResult<()>;

    /// HDEL; `true` if the field existed
    async fn hash_delete(&self, key: &str, field: &str) -> TaskResult<bool>;

    async fn hash_get_all(&self, key: &str) -> TaskResult<HashMap<String, String>>;

    async fn hash_len(&self, key: &str) -> TaskResult<u64>;

    async fn get(&self, key: &str) -> TaskResult<Option<String>>;

    /// SET NX; `true` if this call created the key
    async fn set_if_absent(&self, key: &str, value: &str) -> TaskResult<bool>;

    /// One WATCH / GET / MULTI / DEL / EXEC attempt
    async fn delete_if_equals(&self, key: &str, expected: &str) -> TaskResult<CompareDelete>;
}
