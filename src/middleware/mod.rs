//! Integration adapters that put the rate limiter in front of handlers.
//!
//! - [`UserLimit`] wraps a single handler with a fixed per-identity quota.
//! - [`RouteLimitLayer`] intercepts every inbound HTTP call and applies the
//!   first matching route policy per client address.

mod guard;
mod identity;
mod layer;

pub use guard::{Guarded, UserLimit, UserLimitSettings};
pub use identity::{
    client_address, principal, Identity, PeerAddr, Principal, RequestInfo, RequestMeta,
    FORWARDED_FOR_HEADER, UNKNOWN_IDENTITY,
};
pub use layer::{BoxError, RouteLimitLayer, RouteLimitService, RouteLimiter};

use tracing::warn;

use crate::config::FailureMode;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Decision, Quota, RateLimitKey, RateLimiter};

/// Evaluate `key` and turn the outcome into pass/reject, applying
/// `failure_mode` when the store is unavailable.
pub(crate) async fn enforce(
    limiter: &RateLimiter,
    key: &RateLimitKey,
    quota: Quota,
    failure_mode: FailureMode,
) -> Result<()> {
    match limiter.evaluate(key, quota).await {
        Ok(Decision::Allow) => Ok(()),
        Ok(Decision::Deny) => Err(TurnstileError::RateLimited {
            key: key.to_string(),
        }),
        Err(TurnstileError::StoreUnavailable(e)) => match failure_mode {
            FailureMode::Open => {
                warn!(key = %key, error = %e, "Rate limit store unavailable, failing open");
                Ok(())
            }
            FailureMode::Closed => {
                warn!(key = %key, error = %e, "Rate limit store unavailable, failing closed");
                Err(TurnstileError::StoreUnavailable(e))
            }
        },
        Err(e) => Err(e),
    }
}
