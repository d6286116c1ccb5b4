//! Explicit dispatcher configuration.

use std::time::Duration;

use crate::quota::QuotaPolicy;
use crate::retry::RetryConfig;
use crate::transport::DEFAULT_TIMEOUT;

/// Default cache TTL used by callers that do not pick one: one week.
pub const DEFAULT_TTL: Duration = Duration::from_secs(168 * 3600);

/// Every option that shapes dispatcher behaviour, in one place.
///
/// The quota policy and the pacing interval have no defaults and must be
/// supplied; the remaining options start from documented defaults.
///
/// | option                 | effect                                          | default |
/// |------------------------|-------------------------------------------------|---------|
/// | `quota`                | warn / hard / block monthly thresholds          | none    |
/// | `min_request_interval` | minimum gap between consecutive network calls   | none    |
/// | `request_timeout`      | bound on a single network call                  | 30s     |
/// | `retry`                | attempts and backoff for transient failures     | 3, 1s…30s |
/// | `default_ttl`          | TTL for [`fetch_default`](super::Dispatcher::fetch_default) | 168h |
///
/// ```rust
/// # use heimdall::{DispatcherConfig, QuotaPolicy, RetryConfig};
/// # use std::time::Duration;
/// let config = DispatcherConfig::new(
///     QuotaPolicy::new(2000, 2500, 3000).unwrap(),
///     Duration::from_secs(1),
/// )
/// .request_timeout(Duration::from_secs(10))
/// .retry(RetryConfig::new().max_attempts(4));
/// assert_eq!(config.retry.max_attempts, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub quota: QuotaPolicy,
    pub min_request_interval: Duration,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
    pub default_ttl: Duration,
}

impl DispatcherConfig {
    pub fn new(quota: QuotaPolicy, min_request_interval: Duration) -> Self {
        Self {
            quota,
            min_request_interval,
            request_timeout: DEFAULT_TIMEOUT,
            retry: RetryConfig::default(),
            default_ttl: DEFAULT_TTL,
        }
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
}
