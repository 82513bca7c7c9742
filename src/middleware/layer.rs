//! Route-policy interceptor for inbound HTTP calls.

use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower_layer::Layer;
use tower_service::Service;
use tracing::{debug, trace};

use super::enforce;
use super::identity::{client_address, RequestMeta};
use crate::config::{FailureMode, TurnstileConfig};
use crate::error::Result;
use crate::ratelimit::{KeyBuilder, PolicyRegistry, Quota, RateLimitKey, RateLimiter};

/// Boxed error returned by [`RouteLimitService`]. Rejections are a
/// [`crate::TurnstileError`] and can be recovered with `downcast_ref`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Applies the first matching route policy to each call, keyed by client
/// address.
#[derive(Debug)]
pub struct RouteLimiter {
    limiter: Arc<RateLimiter>,
    registry: PolicyRegistry,
    keys: KeyBuilder,
    failure_mode: FailureMode,
}

impl RouteLimiter {
    pub fn new(
        limiter: Arc<RateLimiter>,
        registry: PolicyRegistry,
        keys: KeyBuilder,
        failure_mode: FailureMode,
    ) -> Self {
        Self {
            limiter,
            registry,
            keys,
            failure_mode,
        }
    }

    /// Build the interceptor from configuration, validating every policy.
    pub fn from_config(limiter: Arc<RateLimiter>, config: &TurnstileConfig) -> Result<Self> {
        Ok(Self::new(
            limiter,
            config.registry()?,
            config.limiter.key_builder()?,
            config.limiter.failure_mode,
        ))
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Window key and quota that apply to `meta`, or `None` when the call
    /// is not rate limited (no matching policy, or unknown client).
    pub fn target<M: RequestMeta + ?Sized>(&self, meta: &M) -> Option<(RateLimitKey, Quota)> {
        let method = meta.request_method();
        let path = meta.request_path();

        let Some(policy) = self.registry.find_policy(method, path) else {
            trace!(method = %method, path = %path, "No rate limit policy matches");
            return None;
        };

        let identity = client_address(meta);
        if identity.is_unknown() {
            debug!(method = %method, path = %path, "Unknown client address, not rate limiting");
            return None;
        }

        Some((self.keys.for_route(policy, identity.as_str()), policy.quota()))
    }

    /// Admit or reject one call.
    pub fn check<M: RequestMeta + ?Sized>(
        &self,
        meta: &M,
    ) -> impl Future<Output = Result<()>> + '_ {
        let target = self.target(meta);
        async move {
            match target {
                Some((key, quota)) => self.enforce(&key, quota).await,
                None => Ok(()),
            }
        }
    }

    async fn enforce(&self, key: &RateLimitKey, quota: Quota) -> Result<()> {
        enforce(&self.limiter, key, quota, self.failure_mode).await
    }
}

/// Tower layer running a [`RouteLimiter`] before every inbound call.
#[derive(Debug, Clone)]
pub struct RouteLimitLayer {
    limiter: Arc<RouteLimiter>,
}

impl RouteLimitLayer {
    pub fn new(limiter: RouteLimiter) -> Self {
        Self {
            limiter: Arc::new(limiter),
        }
    }

    pub fn from_shared(limiter: Arc<RouteLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RouteLimitLayer {
    type Service = RouteLimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RouteLimitService {
            inner: service,
            limiter: self.limiter.clone(),
        }
    }
}

/// Middleware service that short-circuits calls over their route policy.
#[derive(Debug, Clone)]
pub struct RouteLimitService<S> {
    inner: S,
    limiter: Arc<RouteLimiter>,
}

impl<S, B> Service<http::Request<B>> for RouteLimitService<S>
where
    S: Service<http::Request<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        let target = self.limiter.target(&request);
        let limiter = self.limiter.clone();
        // Keep the service that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            if let Some((key, quota)) = target {
                limiter.enforce(&key, quota).await?;
            }
            let response: std::result::Result<S::Response, BoxError> =
                inner.call(request).await.map_err(Into::into);
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{RequestInfo, FORWARDED_FOR_HEADER};
    use crate::ratelimit::{ManualClock, PolicyRule};
    use crate::store::testing::UnreachableStore;
    use crate::store::{MemoryWindowStore, WindowStore};
    use crate::TurnstileError;
    use std::convert::Infallible;
    use tower::{service_fn, ServiceExt};

    fn config(failure_mode: FailureMode) -> TurnstileConfig {
        let mut config = TurnstileConfig::default();
        config.limiter.failure_mode = failure_mode;
        config.policies = vec![PolicyRule {
            method: "GET".to_string(),
            path_prefix: "/a/".to_string(),
            interval_secs: 10,
            max_requests: 1,
        }];
        config
    }

    fn route_limiter(store: Arc<dyn WindowStore>, failure_mode: FailureMode) -> RouteLimiter {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = Arc::new(RateLimiter::with_clock(store, clock));
        RouteLimiter::from_config(limiter, &config(failure_mode)).unwrap()
    }

    fn memory_route_limiter() -> RouteLimiter {
        let store = Arc::new(MemoryWindowStore::with_clock(Arc::new(ManualClock::new(0))));
        route_limiter(store, FailureMode::Open)
    }

    fn request(method: &str, path: &str, client: Option<&str>) -> http::Request<()> {
        let mut builder = http::Request::builder().method(method).uri(path);
        if let Some(client) = client {
            builder = builder.header(FORWARDED_FOR_HEADER, client);
        }
        builder.body(()).unwrap()
    }

    async fn handled(_request: http::Request<()>) -> std::result::Result<&'static str, Infallible> {
        Ok("handled")
    }

    #[tokio::test]
    async fn test_second_call_in_window_is_rejected() {
        let service = RouteLimitLayer::new(memory_route_limiter()).layer(service_fn(handled));

        let first = service.clone().oneshot(request("GET", "/a/b", Some("1.2.3.4"))).await;
        assert_eq!(first.unwrap(), "handled");

        let err = service
            .clone()
            .oneshot(request("GET", "/a/b", Some("1.2.3.4, 5.6.7.6")))
            .await
            .unwrap_err();
        let err = err.downcast_ref::<TurnstileError>().unwrap();
        assert!(err.is_rate_limited());

        // A different client has its own window.
        let other = service.oneshot(request("GET", "/a/c", Some("9.9.9.9"))).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_unmatched_calls_pass_through() {
        let service = RouteLimitLayer::new(memory_route_limiter()).layer(service_fn(handled));

        for _ in 0..3 {
            assert!(service.clone().oneshot(request("POST", "/a/b", Some("1.2.3.4"))).await.is_ok());
            assert!(service.clone().oneshot(request("GET", "/b", Some("1.2.3.4"))).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_unknown_client_is_not_limited() {
        let service = RouteLimitLayer::new(memory_route_limiter()).layer(service_fn(handled));

        for _ in 0..3 {
            assert!(service.clone().oneshot(request("GET", "/a/b", None)).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_forwarded_sentinel_value_is_limited() {
        let service = RouteLimitLayer::new(memory_route_limiter()).layer(service_fn(handled));

        let first = service.clone().oneshot(request("GET", "/a/b", Some("unknown"))).await;
        assert!(first.is_ok());

        let err = service
            .oneshot(request("GET", "/a/b", Some("unknown")))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<TurnstileError>().unwrap().is_rate_limited());
    }

    #[tokio::test]
    async fn test_target_key_includes_route_and_client() {
        let limiter = memory_route_limiter();
        let info = RequestInfo::new("get", "/a/b").with_forwarded_for("1.2.3.4");

        let (key, quota) = limiter.target(&info).unwrap();
        assert_eq!(key.as_str(), "rate_limit_sliding_window:GET:/a/:1.2.3.4");
        assert_eq!(quota.max_requests(), 1);
        assert!(limiter.target(&RequestInfo::new("GET", "/a/b")).is_none());
    }

    #[tokio::test]
    async fn test_check_without_tower() {
        let limiter = memory_route_limiter();
        let info = RequestInfo::new("GET", "/a/x").with_forwarded_for("1.2.3.4");

        assert!(limiter.check(&info).await.is_ok());
        assert!(limiter.check(&info).await.unwrap_err().is_rate_limited());
    }

    #[tokio::test]
    async fn test_store_down_fail_open() {
        let limiter = route_limiter(Arc::new(UnreachableStore), FailureMode::Open);
        let service = RouteLimitLayer::new(limiter).layer(service_fn(handled));

        for _ in 0..3 {
            let response = service.clone().oneshot(request("GET", "/a/b", Some("1.2.3.4"))).await;
            assert_eq!(response.unwrap(), "handled");
        }
    }

    #[tokio::test]
    async fn test_store_down_fail_closed() {
        let limiter = route_limiter(Arc::new(UnreachableStore), FailureMode::Closed);
        let service = RouteLimitLayer::new(limiter).layer(service_fn(handled));

        let err = service
            .oneshot(request("GET", "/a/b", Some("1.2.3.4")))
            .await
            .unwrap_err();
        let err = err.downcast_ref::<TurnstileError>().unwrap();
        assert!(err.is_store_unavailable());
        assert!(!err.is_rate_limited());
    }
}
