//! Rate limiting engine, keys, and policies.

mod clock;
mod key;
mod limiter;
mod rules;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{KeyBuilder, RateLimitKey};
pub use limiter::{Decision, RateLimiter, DEFAULT_OPERATION_TIMEOUT};
pub use rules::{Policy, PolicyRegistry, PolicyRule, Quota};
