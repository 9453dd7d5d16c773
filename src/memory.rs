//! In-process implementation of [`Backend`]
//!
//! Every call takes a single lock over the whole store, so each operation is
//! as atomic as the corresponding Redis command. Useful for tests and for
//! running producers and workers inside one process.

use async_trait::async_trait;
use redis::{ErrorKind, RedisError};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::backend::{Backend, CompareDelete};
use crate::error::{TaskError, TaskResult};

#[derive(Debug, Default)]
struct Store {
    lists: HashMap<String, VecDeque<String>>,
    sorted: HashMap<String, Vec<(String, f64)>>,
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    List,
    Sorted,
    Hash,
    String,
}

impl Store {
    fn holds(&self, key: &str, kind: Kind) -> bool {
        match kind {
            Kind::List => self.lists.contains_key(key),
            Kind::Sorted => self.sorted.contains_key(key),
            Kind::Hash => self.hashes.contains_key(key),
            Kind::String => self.strings.contains_key(key),
        }
    }

    /// Mirrors Redis WRONGTYPE: a key holds exactly one kind of value
    fn check_free(&self, key: &str, wanted: Kind) -> TaskResult<()> {
        let clash = [Kind::List, Kind::Sorted, Kind::Hash, Kind::String]
            .into_iter()
            .filter(|kind| *kind != wanted)
            .any(|kind| self.holds(key, kind));
        if clash {
            return Err(TaskError::from(RedisError::from((
                ErrorKind::ResponseError,
                "WRONGTYPE",
                format!("key {} holds another kind of value than {:?}", key, wanted),
            ))));
        }
        Ok(())
    }
}

/// Cloneable handle to a shared in-memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    store: Arc<Mutex<Store>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn ping(&self) -> TaskResult<()> {
        Ok(())
    }

    async fn push_head(&self, key: &str, value: &str) -> TaskResult<()> {
        let mut store = self.store.lock().await;
        store.check_free(key, Kind::List)?;
        store
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn push_tail(&self, key: &str, value: &str) -> TaskResult<()> {
        let mut store = self.store.lock().await;
        store.check_free(key, Kind::List)?;
        store
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn pop_tail(&self, key: &str) -> TaskResult<Option<String>> {
        let mut store = self.store.lock().await;
        let Some(list) = store.lists.get_mut(key) else {
            return Ok(None);
        };
        let value = list.pop_back();
        if list.is_empty() {
            store.lists.remove(key);
        }
        Ok(value)
    }

    async fn list_len(&self, key: &str) -> TaskResult<u64> {
        let store = self.store.lock().await;
        Ok(store.lists.get(key).map_or(0, |list| list.len() as u64))
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> TaskResult<()> {
        let mut store = self.store.lock().await;
        store.check_free(key, Kind::Sorted)?;
        let set = store.sorted.entry(key.to_string()).or_default();
        set.retain(|(existing, _)| existing != member);

        // Redis orders equal scores lexicographically by member
        let position = set
            .iter()
            .position(|(m, s)| *s > score || (*s == score && m.as_str() > member))
            .unwrap_or(set.len());
        set.insert(position, (member.to_string(), score));
        Ok(())
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> TaskResult<bool> {
        let mut store = self.store.lock().await;
        let Some(set) = store.sorted.get_mut(key) else {
            return Ok(false);
        };
        let before = set.len();
        set.retain(|(existing, _)| existing != member);
        let removed = set.len() < before;
        if set.is_empty() {
            store.sorted.remove(key);
        }
        Ok(removed)
    }

    async fn sorted_first(&self, key: &str) -> TaskResult<Option<(String, f64)>> {
        let store = self.store.lock().await;
        Ok(store.sorted.get(key).and_then(|set| set.first().cloned()))
    }

    async fn sorted_len(&self, key: &str) -> TaskResult<u64> {
        let store = self.store.lock().await;
        Ok(store.sorted.get(key).map_or(0, |set| set.len() as u64))
    }

    async fn hash_get(&self, key: &str, field: &str) -> TaskResult<Option<String>> {
        let store = self.store.lock().await;
        Ok(store.hashes.get(key).and_then(|hash| hash.get(field).cloned()))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> TaskResult<()> {
        let mut store = self.store.lock().await;
        store.check_free(key, Kind::Hash)?;
        store
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> TaskResult<bool> {
        let mut store = self.store.lock().await;
        let Some(hash) = store.hashes.get_mut(key) else {
            return Ok(false);
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            store.hashes.remove(key);
        }
        Ok(removed)
    }

    async fn hash_get_all(&self, key: &str) -> TaskResult<HashMap<String, String>> {
        let store = self.store.lock().await;
        Ok(store.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_len(&self, key: &str) -> TaskResult<u64> {
        let store = self.store.lock().await;
        Ok(store.hashes.get(key).map_or(0, |hash| hash.len() as u64))
    }

    async fn get(&self, key: &str) -> TaskResult<Option<String>> {
        let store = self.store.lock().await;
        Ok(store.strings.get(key).cloned())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> TaskResult<bool> {
        let mut store = self.store.lock().await;
        store.check_free(key, Kind::String)?;
        if store.strings.contains_key(key) {
            return Ok(false);
        }
        store.strings.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> TaskResult<CompareDelete> {
        let mut store = self.store.lock().await;
        if store.strings.get(key).map(|current| current.as_str()) != Some(expected) {
            return Ok(CompareDelete::Mismatch);
        }
        store.strings.remove(key);
        Ok(CompareDelete::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_push_and_pop_ends() {
        let backend = MemoryBackend::new();
        backend.push_head("q", "a").await.unwrap();
        backend.push_head("q", "b").await.unwrap();
        backend.push_tail("q", "c").await.unwrap();

        assert_eq!(backend.list_len("q").await.unwrap(), 3);
        assert_eq!(backend.pop_tail("q").await.unwrap().as_deref(), Some("c"));
        assert_eq!(backend.pop_tail("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(backend.pop_tail("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(backend.pop_tail("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sorted_set_orders_by_score_and_replaces_members() {
        let backend = MemoryBackend::new();
        backend.sorted_add("z", "late", 20.0).await.unwrap();
        backend.sorted_add("z", "early", 10.0).await.unwrap();
        assert_eq!(
            backend.sorted_first("z").await.unwrap(),
            Some(("early".to_string(), 10.0))
        );

        backend.sorted_add("z", "early", 30.0).await.unwrap();
        assert_eq!(backend.sorted_len("z").await.unwrap(), 2);
        assert_eq!(
            backend.sorted_first("z").await.unwrap(),
            Some(("late".to_string(), 20.0))
        );

        assert!(backend.sorted_remove("z", "late").await.unwrap());
        assert!(!backend.sorted_remove("z", "late").await.unwrap());
    }

    #[tokio::test]
    async fn equal_scores_fall_back_to_member_order() {
        let backend = MemoryBackend::new();
        backend.sorted_add("z", "b", 1.0).await.unwrap();
        backend.sorted_add("z", "a", 1.0).await.unwrap();
        assert_eq!(
            backend.sorted_first("z").await.unwrap().map(|(m, _)| m),
            Some("a".to_string())
        );
    }

    #[tokio::test]
    async fn compare_and_delete_respects_value() {
        let backend = MemoryBackend::new();
        assert!(backend.set_if_absent("k", "one").await.unwrap());
        assert!(!backend.set_if_absent("k", "two").await.unwrap());

        assert_eq!(
            backend.delete_if_equals("k", "two").await.unwrap(),
            CompareDelete::Mismatch
        );
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("one"));
        assert_eq!(
            backend.delete_if_equals("k", "one").await.unwrap(),
            CompareDelete::Deleted
        );
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn wrong_type_is_rejected() {
        let backend = MemoryBackend::new();
        backend.push_head("k", "a").await.unwrap();
        let err = backend.hash_set("k", "f", "v").await.unwrap_err();
        assert!(matches!(err, TaskError::Redis(ref e) if e.kind() == ErrorKind::ResponseError));
        assert!(!err.is_recoverable());
    }
}
