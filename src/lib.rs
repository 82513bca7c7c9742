//! Turnstile - Sliding-Window Admission Control
//!
//! This crate decides, for each incoming call identified by a key (a user id,
//! a client address, or either combined with a route), whether the call may
//! proceed or would exceed its configured rate. Windows are exact sliding
//! logs kept in a shared store and evaluated atomically on the store side, so
//! any number of stateless callers can share one limit.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod store;

pub use config::{FailureMode, TurnstileConfig};
pub use error::{Result, TurnstileError};
pub use ratelimit::{Decision, RateLimiter};
