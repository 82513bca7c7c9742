//! Per-handler rate limiting by explicit composition.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use super::enforce;
use super::identity::Identity;
use crate::config::FailureMode;
use crate::error::Result;
use crate::ratelimit::{KeyBuilder, Quota, RateLimitKey, RateLimiter};

/// Parameters fixed when a handler is wrapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserLimitSettings {
    /// Namespace prefix of this handler's windows
    pub key_prefix: String,
    /// Separator between the prefix and the identity
    pub separator: String,
    /// Window length in seconds
    pub interval_secs: u64,
    /// Maximum admissions per identity inside the window
    pub max_requests: u64,
    /// Behavior when the store is unavailable
    pub failure_mode: FailureMode,
}

impl UserLimitSettings {
    pub fn new(key_prefix: impl Into<String>, interval_secs: u64, max_requests: u64) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            separator: ":".to_string(),
            interval_secs,
            max_requests,
            failure_mode: FailureMode::default(),
        }
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }
}

/// A fixed per-identity limit bound to one handler.
///
/// `identify` extracts the identity from the request, typically
/// [`super::principal`]; it must run after authentication. Calls whose
/// identity is unknown are not limited.
pub struct UserLimit<F> {
    limiter: Arc<RateLimiter>,
    keys: KeyBuilder,
    quota: Quota,
    failure_mode: FailureMode,
    identify: F,
}

impl<F> UserLimit<F> {
    /// Validate `settings` and bind them. Malformed settings fail here, never
    /// at call time.
    pub fn new(limiter: Arc<RateLimiter>, settings: UserLimitSettings, identify: F) -> Result<Self> {
        Ok(Self {
            limiter,
            keys: KeyBuilder::new(settings.key_prefix, settings.separator)?,
            quota: Quota::per_seconds(settings.interval_secs, settings.max_requests)?,
            failure_mode: settings.failure_mode,
            identify,
        })
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// Window key for `request`, or `None` when its identity is unknown.
    pub fn key_for<R: ?Sized>(&self, request: &R) -> Option<RateLimitKey>
    where
        F: Fn(&R) -> Identity,
    {
        match (self.identify)(request) {
            Identity::Known(identity) => Some(self.keys.for_identity(&identity)),
            Identity::Unknown => None,
        }
    }

    /// Admit or reject one call.
    ///
    /// Fails with [`crate::TurnstileError::RateLimited`] when the window is
    /// full, and with [`crate::TurnstileError::StoreUnavailable`] when the
    /// store is down and the failure mode is closed.
    pub fn admit<R: ?Sized>(&self, request: &R) -> impl Future<Output = Result<()>> + '_
    where
        F: Fn(&R) -> Identity,
    {
        let key = self.key_for(request);
        async move {
            match key {
                Some(key) => enforce(&self.limiter, &key, self.quota, self.failure_mode).await,
                None => {
                    debug!(prefix = %self.keys.prefix(), "Unknown identity, not rate limiting");
                    Ok(())
                }
            }
        }
    }

    /// Put this limit in front of `handler`.
    pub fn wrap<H>(self, handler: H) -> Guarded<F, H> {
        Guarded {
            limit: self,
            handler,
        }
    }
}

/// A handler behind a [`UserLimit`].
pub struct Guarded<F, H> {
    limit: UserLimit<F>,
    handler: H,
}

impl<F, H> Guarded<F, H> {
    /// Run the handler if the call is admitted, returning its output
    /// unchanged. A rejected call never reaches the handler.
    pub async fn call<R, Fut>(&self, request: R) -> Result<Fut::Output>
    where
        F: Fn(&R) -> Identity,
        H: Fn(R) -> Fut,
        Fut: Future,
    {
        self.limit.admit(&request).await?;
        Ok((self.handler)(request).await)
    }

    pub fn limit(&self) -> &UserLimit<F> {
        &self.limit
    }
}
