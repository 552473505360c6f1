use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use super::errors::Result;
use super::types::{ApiRequest, ApiResponse, RateLimitInfo, RemoteApi};

/// Type alias for the governor rate limiter.
type GovernorRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Default request rates (requests per second).
pub mod rate_limits {
    /// Backlog allows roughly 150 reads/minute per user on standard plans;
    /// 2/sec keeps well clear of it while leaving room for bursts.
    pub const BACKLOG_DEFAULT_RPS: u32 = 2;
}

/// A standalone API rate limiter using the governor crate.
///
/// Used directly by the scheduler to pace stage 3 requests and wrapped
/// around clients by [`RateLimitedClient`].
///
/// # Example
///
/// ```ignore
/// use projectlens::remote::ApiRateLimiter;
///
/// let limiter = ApiRateLimiter::with_min_interval(Duration::from_secs(2));
///
/// // Before each API call:
/// limiter.wait().await;
/// client.request(request).await?;
/// ```
#[derive(Clone)]
pub struct ApiRateLimiter {
    inner: Arc<GovernorRateLimiter>,
}

impl ApiRateLimiter {
    /// Create a new rate limiter with the specified requests per second.
    ///
    /// A rate of zero is treated as one request per second.
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            inner: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
        }
    }

    /// Create a limiter that admits one request per `interval`, with no burst.
    ///
    /// The first request passes immediately; each following request waits
    /// until `interval` has elapsed since the previous one. A zero interval
    /// disables pacing.
    pub fn with_min_interval(interval: Duration) -> Self {
        let quota = Quota::with_period(interval)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX))
            .allow_burst(NonZeroU32::MIN);
        Self {
            inner: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Wait until a request is allowed by the rate limiter.
    pub async fn wait(&self) {
        self.inner.until_ready().await;
    }
}

/// A rate-limited wrapper around any [`RemoteApi`].
///
/// All requests wait for the limiter before delegating to the inner client.
/// Rate limit status probes are not paced; they are cheap header reads.
pub struct RateLimitedClient<C> {
    inner: C,
    rate_limiter: ApiRateLimiter,
}

impl<C> RateLimitedClient<C> {
    /// Wrap `inner`, allowing at most `requests_per_second`.
    pub fn new(inner: C, requests_per_second: u32) -> Self {
        Self {
            inner,
            rate_limiter: ApiRateLimiter::new(requests_per_second),
        }
    }

    /// Get a reference to the inner client.
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: Clone> Clone for RateLimitedClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            rate_limiter: self.rate_limiter.clone(),
        }
    }
}

#[async_trait]
impl<C: RemoteApi> RemoteApi for RateLimitedClient<C> {
    async fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.rate_limiter.wait().await;
        self.inner.request(request).await
    }

    async fn rate_limit_status(&self) -> Result<RateLimitInfo> {
        self.inner.rate_limit_status().await
    }
}
