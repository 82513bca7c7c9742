//! Shared window store contract.
//!
//! A window store keeps one ordered set of admission timestamps per rate
//! limit key and runs the sliding-window evaluation atomically on its side.
//! The engine never reads and writes a window in separate round-trips; all
//! cross-caller coordination is delegated to the store's atomicity.

mod memory;
mod redis_store;
mod script;

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::Decision;

pub use memory::MemoryWindowStore;
pub use redis_store::{RedisStoreConfig, RedisWindowStore};
pub use script::{REPLY_ALLOW, REPLY_DENY, SLIDING_WINDOW_LUA};

/// Errors that can occur while talking to a window store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to connect to store: {0}")]
    Connection(String),
    #[error("evaluation script failed: {0}")]
    Script(String),
    /// The store no longer knows the cached script handle (e.g. restart).
    #[error("evaluation script is not loaded in the store")]
    ScriptNotLoaded,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Opaque identifier of the evaluation script once loaded into a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptHandle(String);

impl ScriptHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScriptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Arguments of one evaluation of the sliding-window script.
#[derive(Debug, Clone, Copy)]
pub struct WindowCall<'a> {
    /// The window key.
    pub key: &'a str,
    /// Current time in milliseconds; becomes the score of the new entry.
    pub now_ms: u64,
    /// Window length in milliseconds; also the record's time-to-live.
    pub window_ms: u64,
    /// Maximum number of entries allowed inside the window.
    pub capacity: u64,
    /// Unique member stored for this admission.
    pub member: &'a str,
}

impl WindowCall<'_> {
    /// Lowest score still inside the window. Entries strictly below it are
    /// purged before counting.
    pub fn window_start(&self) -> u64 {
        self.now_ms.saturating_sub(self.window_ms)
    }
}

/// Trait for shared window stores.
///
/// Implementations must run [`WindowStore::run_script`] as one indivisible
/// unit per key: no other evaluation against the same key may interleave
/// between the count and the conditional insert.
#[async_trait]
pub trait WindowStore: Send + Sync + Debug {
    /// Load the evaluation script and return its handle.
    async fn load_script(&self) -> Result<ScriptHandle, StoreError>;

    /// Atomically purge, count, and conditionally record one admission.
    ///
    /// Returns [`StoreError::ScriptNotLoaded`] when `script` is unknown to
    /// the store.
    async fn run_script(
        &self,
        script: &ScriptHandle,
        call: &WindowCall<'_>,
    ) -> Result<Decision, StoreError>;

    /// Number of entries currently recorded for `key`, or `None` when the
    /// key does not exist (never used, or expired). Not bounded here; go
    /// through [`crate::RateLimiter::window_len`] for a timed inspection.
    async fn window_len(&self, key: &str) -> Result<Option<usize>, StoreError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_start_saturates() {
        let call = WindowCall {
            key: "k",
            now_ms: 500,
            window_ms: 1000,
            capacity: 1,
            member: "m",
        };
        assert_eq!(call.window_start(), 0);

        let call = WindowCall { now_ms: 1500, ..call };
        assert_eq!(call.window_start(), 500);
    }
}
