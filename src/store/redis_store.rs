//! Redis-backed window store.
//!
//! Each window is a sorted set whose members are unique admission ids and
//! whose scores are admission timestamps in milliseconds. The evaluation runs
//! as a Lua script via `EVALSHA`, which Redis executes atomically, so
//! concurrent callers sharing one Redis never race between the count and the
//! insert.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ErrorKind, RedisError};
use tracing::{debug, info};

use super::script::{REPLY_ALLOW, REPLY_DENY, SLIDING_WINDOW_LUA};
use super::{ScriptHandle, StoreError, WindowCall, WindowStore};
use crate::ratelimit::Decision;

/// Connection settings for [`RedisWindowStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL (e.g. "redis://127.0.0.1:6379/0")
    pub url: String,
    /// Bound on establishing the initial connection
    pub connect_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            connect_timeout: Duration::from_millis(500),
        }
    }
}

/// Window store backed by a shared Redis instance.
#[derive(Clone)]
pub struct RedisWindowStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisWindowStore {
    /// Connect to Redis with default settings.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(RedisStoreConfig {
            url: url.to_string(),
            ..RedisStoreConfig::default()
        })
        .await
    }

    /// Connect to Redis, failing if the connection is not established
    /// within `config.connect_timeout`.
    pub async fn connect_with_config(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())?;
        let connection =
            match tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
                .await
            {
                Ok(connection) => connection.map_err(connection_error)?,
                Err(_) => return Err(StoreError::Timeout(config.connect_timeout)),
            };

        info!(url = %redact(&config.url), "Connected to Redis window store");
        Ok(Self { connection, config })
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn load_script(&self) -> Result<ScriptHandle, StoreError> {
        let mut conn = self.connection.clone();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(SLIDING_WINDOW_LUA)
            .query_async(&mut conn)
            .await
            .map_err(connection_error)?;
        debug!(sha = %sha, "Loaded sliding window script into Redis");
        Ok(ScriptHandle::new(sha))
    }

    async fn run_script(
        &self,
        script: &ScriptHandle,
        call: &WindowCall<'_>,
    ) -> Result<Decision, StoreError> {
        let mut conn = self.connection.clone();
        let reply: i64 = redis::cmd("EVALSHA")
            .arg(script.as_str())
            .arg(1)
            .arg(call.key)
            .arg(call.now_ms)
            .arg(call.window_ms)
            .arg(call.capacity)
            .arg(call.member)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                if e.kind() == ErrorKind::NoScriptError {
                    StoreError::ScriptNotLoaded
                } else {
                    connection_error(e)
                }
            })?;

        match reply {
            REPLY_ALLOW => Ok(Decision::Allow),
            REPLY_DENY => Ok(Decision::Deny),
            other => Err(StoreError::Script(format!("unexpected script reply {}", other))),
        }
    }

    async fn window_len(&self, key: &str) -> Result<Option<usize>, StoreError> {
        let mut conn = self.connection.clone();
        // Redis deletes empty sorted sets, so a zero cardinality means the
        // key does not exist.
        let len: usize = conn.zcard(key).await.map_err(connection_error)?;
        Ok((len > 0).then_some(len))
    }
}

fn connection_error(e: RedisError) -> StoreError {
    if e.is_timeout() {
        StoreError::Connection(format!("timed out: {}", e))
    } else if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Redis(e)
    }
}

/// Hide the password part of a connection URL for logging.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_hides_credentials() {
        assert_eq!(redact("redis://:123456@127.0.0.1:6379/0"), "redis://***@127.0.0.1:6379/0");
        assert_eq!(redact("redis://127.0.0.1/"), "redis://127.0.0.1/");
    }

    #[test]
    fn test_default_config() {
        let config = RedisStoreConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert!(config.url.starts_with("redis://"));
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let result = RedisWindowStore::connect("not a url").await;
        assert!(result.is_err());
    }
}
