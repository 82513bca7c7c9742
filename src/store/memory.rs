//! In-process window store.
//!
//! Executes the sliding-window evaluation natively while holding the
//! key's map entry exclusively, which gives the same per-key atomicity the
//! shared store provides through server-side scripting. Calls against
//! different keys proceed in parallel. Suitable for tests and single-process
//! deployments; state is not shared between processes.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{ScriptHandle, StoreError, WindowCall, WindowStore};
use crate::ratelimit::{Clock, Decision, SystemClock};

/// One window record: entries ordered by `(score, member)`.
#[derive(Debug, Default)]
struct WindowRecord {
    entries: BTreeSet<(u64, String)>,
    /// Store-clock time at which the whole record expires
    expires_at_ms: u64,
}

impl WindowRecord {
    /// A record lives through `expires_at_ms` itself, matching store TTLs.
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at_ms
    }

    fn evaluate(&mut self, call: &WindowCall<'_>, store_now_ms: u64) -> Decision {
        if self.is_expired(store_now_ms) {
            self.entries.clear();
        }

        let window_start = call.window_start();
        self.entries.retain(|(score, _)| *score >= window_start);

        if (self.entries.len() as u64) < call.capacity {
            self.entries.insert((call.now_ms, call.member.to_string()));
            self.expires_at_ms = store_now_ms.saturating_add(call.window_ms);
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

/// Window store kept in process memory.
#[derive(Debug)]
pub struct MemoryWindowStore {
    windows: DashMap<String, WindowRecord>,
    clock: Arc<dyn Clock>,
    /// Bumped on every flush so stale handles are rejected
    generation: AtomicU64,
    loads: AtomicUsize,
}

impl MemoryWindowStore {
    /// Create a store that expires records against the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store that expires records against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
            generation: AtomicU64::new(0),
            loads: AtomicUsize::new(0),
        }
    }

    /// Number of times the evaluation script has been loaded.
    pub fn script_loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Forget every loaded script, as a store restart would.
    pub fn flush_scripts(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove every expired record and return how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.windows.len();
        self.windows.retain(|_, record| !record.is_expired(now));
        before.saturating_sub(self.windows.len())
    }

    /// Number of keys currently held, expired or not.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    fn current_handle(&self) -> ScriptHandle {
        ScriptHandle::new(format!("memory-{}", self.generation.load(Ordering::SeqCst)))
    }
}

impl Default for MemoryWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn load_script(&self) -> Result<ScriptHandle, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.current_handle())
    }

    async fn run_script(
        &self,
        script: &ScriptHandle,
        call: &WindowCall<'_>,
    ) -> Result<Decision, StoreError> {
        if *script != self.current_handle() {
            return Err(StoreError::ScriptNotLoaded);
        }

        let store_now = self.clock.now_millis();
        let decision = self
            .windows
            .entry(call.key.to_string())
            .or_default()
            .evaluate(call, store_now);

        // A denied call against a fresh key leaves an empty record behind.
        self.windows
            .remove_if(call.key, |_, record| record.entries.is_empty());

        trace!(key = call.key, decision = ?decision, "Evaluated in-memory window");
        Ok(decision)
    }

    async fn window_len(&self, key: &str) -> Result<Option<usize>, StoreError> {
        let now = self.clock.now_millis();
        if self
            .windows
            .remove_if(key, |_, record| record.is_expired(now))
            .is_some()
        {
            return Ok(None);
        }
        Ok(self.windows.get(key).map(|record| record.entries.len()))
    }
}
