//! Store connection settings

use std::env;

use crate::error::{TaskError, TaskResult};

/// Connection and key layout settings for the shared store.
///
/// Loading these is the embedding process's job; [`StoreConfig::from_env`] is
/// provided for the common case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Redis host
    pub host: String,
    /// Redis port
    pub port: u16,
    /// Redis database index
    pub database: i64,
    /// Prefix applied to every key this crate touches
    pub key_prefix: String,
    /// Logical name of the hash holding worker signatures
    pub worker_registration_key: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            key_prefix: "tasker".to_string(),
            worker_registration_key: "workers".to_string(),
        }
    }
}

impl StoreConfig {
    /// Load settings from `TASKER_*` environment variables, falling back to defaults
    pub fn from_env() -> TaskResult<Self> {
        let defaults = Self::default();

        Ok(Self {
            host: env::var("TASKER_REDIS_HOST").unwrap_or(defaults.host),
            port: parse_var("TASKER_REDIS_PORT", defaults.port)?,
            database: parse_var("TASKER_REDIS_DB", defaults.database)?,
            key_prefix: env::var("TASKER_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            worker_registration_key: env::var("TASKER_WORKER_REGISTRATION_KEY")
                .unwrap_or(defaults.worker_registration_key),
        })
    }

    /// Connection URL in the form the redis client expects
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.database)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> TaskResult<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| TaskError::config(format!("{} is not valid: {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_url_points_at_local_redis() {
        let config = StoreConfig::default();
        assert_eq!(config.redis_url(), "redis://127.0.0.1:6379/0");
    }

    #[test]
    fn url_carries_database_index() {
        let config = StoreConfig {
            host: "cache.internal".to_string(),
            port: 6380,
            database: 3,
            ..Default::default()
        };
        assert_eq!(config.redis_url(), "redis://cache.internal:6380/3");
    }

    #[test]
    fn parse_var_rejects_garbage() {
        env::set_var("TASKER_TEST_PARSE_PORT", "not-a-port");
        let result = parse_var::<u16>("TASKER_TEST_PARSE_PORT", 6379);
        env::remove_var("TASKER_TEST_PARSE_PORT");
        assert!(matches!(result, Err(TaskError::Config { .. })));
    }

    #[test]
    fn parse_var_falls_back_when_unset() {
        let value = parse_var::<i64>("TASKER_TEST_SURELY_UNSET", 7).unwrap();
        assert_eq!(value, 7);
    }
}
