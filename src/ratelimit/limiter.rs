//! Core sliding-window rate limiter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::store::{ScriptHandle, StoreError, WindowCall, WindowStore};

use super::clock::{Clock, SystemClock};
use super::key::RateLimitKey;
use super::rules::Quota;

/// Default bound on every store round-trip.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(500);

/// The outcome of evaluating one call against its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The call was admitted and recorded in the window.
    Allow,
    /// The window is full; nothing was recorded.
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// The sliding-window rate limiter.
///
/// The limiter keeps no per-key state: every evaluation is a single atomic
/// script execution in the shared store. The only thing cached in-process is
/// the handle of the loaded evaluation script. Instances are cheap to share
/// behind an `Arc` across request-handling tasks.
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
    /// Handle of the evaluation script, loaded on first use
    script: RwLock<Option<ScriptHandle>>,
    operation_timeout: Duration,
}

impl RateLimiter {
    /// Create a rate limiter over `store` using the system clock.
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock::new()))
    }

    /// Create a rate limiter with an explicit clock.
    pub fn with_clock(store: Arc<dyn WindowStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            script: RwLock::new(None),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Bound each store round-trip by `timeout`.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    /// Evaluate one call against the window identified by `key`.
    ///
    /// On [`Decision::Allow`] the call has been recorded in the window. Store
    /// failures surface as [`crate::TurnstileError::StoreUnavailable`] and are
    /// never retried; the caller picks fail-open or fail-closed.
    pub async fn evaluate(&self, key: &RateLimitKey, quota: Quota) -> Result<Decision> {
        let now_ms = self.clock.now_millis();
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());
        let call = WindowCall {
            key: key.as_str(),
            now_ms,
            window_ms: quota.interval_ms(),
            capacity: quota.max_requests(),
            member: &member,
        };

        trace!(
            key = %key,
            now_ms = now_ms,
            window_ms = call.window_ms,
            capacity = call.capacity,
            "Evaluating sliding window"
        );

        let script = self.script_handle().await?;
        let decision = match self.bounded(self.store.run_script(&script, &call)).await {
            Err(StoreError::ScriptNotLoaded) => {
                debug!(script = %script, "Evaluation script missing from store, reloading");
                self.invalidate(&script);
                let script = self.script_handle().await?;
                self.bounded(self.store.run_script(&script, &call)).await?
            }
            other => other?,
        };

        if decision == Decision::Deny {
            debug!(key = %key, "Rate limit exceeded");
        }
        Ok(decision)
    }

    /// Entries currently recorded for `key`, or `None` when the window does
    /// not exist. Bounded by the operation timeout like every engine call.
    pub async fn window_len(&self, key: &RateLimitKey) -> Result<Option<usize>> {
        Ok(self.bounded(self.store.window_len(key.as_str())).await?)
    }

    /// Load the evaluation script into the store ahead of the first call.
    pub async fn preload(&self) -> Result<ScriptHandle> {
        self.script_handle().await
    }

    async fn script_handle(&self) -> Result<ScriptHandle> {
        if let Some(handle) = self.script.read().as_ref() {
            return Ok(handle.clone());
        }

        let handle = self.bounded(self.store.load_script()).await?;
        debug!(script = %handle, "Loaded evaluation script");
        *self.script.write() = Some(handle.clone());
        Ok(handle)
    }

    fn invalidate(&self, stale: &ScriptHandle) {
        let mut cached = self.script.write();
        if cached.as_ref() == Some(stale) {
            *cached = None;
        }
    }

    async fn bounded<T, F>(&self, operation: F) -> std::result::Result<T, StoreError>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.operation_timeout, operation).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_ms = self.operation_timeout.as_millis() as u64,
                    "Window store operation timed out"
                );
                Err(StoreError::Timeout(self.operation_timeout))
            }
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store)
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}
