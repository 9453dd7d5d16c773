//! Redis implementation of [`Backend`]

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::backend::{Backend, CompareDelete};
use crate::config::StoreConfig;
use crate::error::{TaskError, TaskResult};

fn failed(operation: &'static str) -> impl FnOnce(RedisError) -> TaskError {
    move |e| {
        debug!("Redis {} failed: {}", operation, e);
        TaskError::from(e)
    }
}

/// Redis-backed store handle.
///
/// Regular commands go through a shared [`ConnectionManager`], which
/// multiplexes concurrent callers and reconnects after connection loss.
/// WATCH is connection-scoped, so compare-and-delete opens a dedicated
/// connection per attempt.
#[derive(Clone)]
pub struct RedisBackend {
    client: Client,
    manager: ConnectionManager,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("connection", self.client.get_connection_info())
            .finish()
    }
}

impl RedisBackend {
    /// Connect and verify the server answers PING
    pub async fn connect(config: &StoreConfig) -> TaskResult<Self> {
        Self::connect_url(&config.redis_url()).await
    }

    pub async fn connect_url(url: &str) -> TaskResult<Self> {
        let client = Client::open(url).map_err(failed("connect"))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(failed("connect"))?;

        let backend = Self { client, manager };
        backend.ping().await?;

        info!("Connected to Redis at {}", url);
        Ok(backend)
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn ping(&self) -> TaskResult<()> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(failed("ping"))?;
        Ok(())
    }

    async fn push_head(&self, key: &str, value: &str) -> TaskResult<()> {
        self.conn()
            .lpush::<_, _, ()>(key, value)
            .await
            .map_err(failed("lpush"))
    }

    async fn push_tail(&self, key: &str, value: &str) -> TaskResult<()> {
        self.conn()
            .rpush::<_, _, ()>(key, value)
            .await
            .map_err(failed("rpush"))
    }

    async fn pop_tail(&self, key: &str) -> TaskResult<Option<String>> {
        self.conn()
            .rpop::<_, Option<String>>(key, None)
            .await
            .map_err(failed("rpop"))
    }

    async fn list_len(&self, key: &str) -> TaskResult<u64> {
        self.conn()
            .llen::<_, u64>(key)
            .await
            .map_err(failed("llen"))
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> TaskResult<()> {
        self.conn()
            .zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(failed("zadd"))
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> TaskResult<bool> {
        let removed: i64 = self
            .conn()
            .zrem(key, member)
            .await
            .map_err(failed("zrem"))?;
        Ok(removed > 0)
    }

    async fn sorted_first(&self, key: &str) -> TaskResult<Option<(String, f64)>> {
        let items: Vec<(String, f64)> = self
            .conn()
            .zrange_withscores(key, 0, 0)
            .await
            .map_err(failed("zrange"))?;
        Ok(items.into_iter().next())
    }

    async fn sorted_len(&self, key: &str) -> TaskResult<u64> {
        self.conn()
            .zcard::<_, u64>(key)
            .await
            .map_err(failed("zcard"))
    }

    async fn hash_get(&self, key: &str, field: &str) -> TaskResult<Option<String>> {
        self.conn()
            .hget::<_, _, Option<String>>(key, field)
            .await
            .map_err(failed("hget"))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> TaskResult<()> {
        self.conn()
            .hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(failed("hset"))
    }

    async fn hash_delete(&self, key: &str, field: &str) -> TaskResult<bool> {
        let removed: i64 = self
            .conn()
            .hdel(key, field)
            .await
            .map_err(failed("hdel"))?;
        Ok(removed > 0)
    }

    async fn hash_get_all(&self, key: &str) -> TaskResult<HashMap<String, String>> {
        self.conn()
            .hgetall::<_, HashMap<String, String>>(key)
            .await
            .map_err(failed("hgetall"))
    }

    async fn hash_len(&self, key: &str) -> TaskResult<u64> {
        self.conn()
            .hlen::<_, u64>(key)
            .await
            .map_err(failed("hlen"))
    }

    async fn get(&self, key: &str) -> TaskResult<Option<String>> {
        self.conn()
            .get::<_, Option<String>>(key)
            .await
            .map_err(failed("get"))
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> TaskResult<bool> {
        self.conn()
            .set_nx::<_, _, bool>(key, value)
            .await
            .map_err(failed("setnx"))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> TaskResult<CompareDelete> {
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(failed("watch"))?;

        redis::cmd("WATCH")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(failed("watch"))?;

        let current: Option<String> = conn.get(key).await.map_err(failed("get"))?;
        if current.as_deref() != Some(expected) {
            redis::cmd("UNWATCH")
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(failed("unwatch"))?;
            return Ok(CompareDelete::Mismatch);
        }

        // EXEC replies nil when the watched key changed after WATCH
        let reply: Option<(i64,)> = redis::pipe()
            .atomic()
            .del(key)
            .query_async(&mut conn)
            .await
            .map_err(failed("exec"))?;

        match reply {
            Some(_) => Ok(CompareDelete::Deleted),
            None => {
                debug!("Transaction on {} aborted by a concurrent writer", key);
                Ok(CompareDelete::Contended)
            }
        }
    }
}
