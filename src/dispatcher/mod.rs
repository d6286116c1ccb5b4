//! The request dispatcher.
//!
//! [`Dispatcher`] is the single entry point for provider data. Every
//! request walks the same path:
//!
//! ```text
//! CacheCheck ── fresh hit ──────────────────────────────────▶ payload
//!     │ miss / force_refresh
//!     ▼
//! QuotaCheck ── Block ──────────────────────────────────────▶ QuotaExceeded
//!     │ Allow / AllowWithWarning
//!     ▼
//! RateLimitWait
//!     ▼
//! NetworkCall ── success ── ledger, cache ──────────────────▶ payload
//!     │   └──── permanent ── ledger ────────────────────────▶ provider error
//!     └──────── transient ── ledger, backoff ── QuotaCheck ...
//!                               └── attempts spent ─────────▶ RetryExhausted
//! ```
//!
//! Cache hits cost nothing. Every attempt that reaches the provider,
//! retries included, leaves exactly one usage record.

mod builder;
mod config;

pub use builder::{DispatcherBuilder, Heimdall};
pub use config::{DEFAULT_TTL, DispatcherConfig};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;
use crate::fingerprint::Params;
use crate::ledger::{CallOutcome, UsageLedger, UsageMonth, UsageRecord};
use crate::limiter::RateLimiter;
use crate::quota::{Decision, QuotaGuard, QuotaSnapshot};
use crate::request::FetchRequest;
use crate::telemetry;
use crate::transport::Transport;
use crate::{HeimdallError, Result};

/// Quota-governed, cache-first gateway to the provider.
///
/// Construct with [`Heimdall::builder`]. The dispatcher is `Send + Sync`
/// and is meant to be shared as `Arc<Dispatcher>`.
pub struct Dispatcher {
    cache: Arc<dyn CacheStore>,
    ledger: Arc<UsageLedger>,
    limiter: RateLimiter,
    guard: QuotaGuard,
    transport: Arc<dyn Transport>,
    config: DispatcherConfig,
    /// Serializes quota admission so concurrent callers see each other.
    admission: Mutex<()>,
    /// Admitted calls whose usage record has not been written yet.
    in_flight: AtomicU64,
}

/// An admitted network call. Releases its in-flight slot on drop, which
/// happens after the attempt has been recorded.
struct Admission<'a> {
    in_flight: &'a AtomicU64,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Dispatcher {
    pub(crate) fn new(
        cache: Arc<dyn CacheStore>,
        ledger: Arc<UsageLedger>,
        limiter: RateLimiter,
        transport: Arc<dyn Transport>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            cache,
            ledger,
            limiter,
            guard: QuotaGuard::new(config.quota),
            transport,
            config,
            admission: Mutex::new(()),
            in_flight: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    /// Fetch `endpoint` with `params`, serving from cache when an entry
    /// younger than `ttl` exists and `force_refresh` is false.
    pub async fn fetch(
        &self,
        endpoint: &str,
        params: &Params,
        ttl: Duration,
        force_refresh: bool,
    ) -> Result<Value> {
        let request = FetchRequest::new(endpoint, params.clone());
        self.fetch_request(&request, ttl, force_refresh).await
    }

    /// [`fetch`](Self::fetch) with the configured default TTL.
    pub async fn fetch_default(&self, endpoint: &str, params: &Params) -> Result<Value> {
        self.fetch(endpoint, params, self.config.default_ttl, false)
            .await
    }

    /// Fetch a prepared request, e.g. one built by [`crate::endpoints`].
    pub async fn fetch_request(
        &self,
        request: &FetchRequest,
        ttl: Duration,
        force_refresh: bool,
    ) -> Result<Value> {
        let endpoint = request.endpoint().to_string();

        if !force_refresh
            && let Some(entry) = self.cache.get(request.fingerprint()).await
            && self.cache.is_fresh(&entry, ttl)
        {
            debug!(
                endpoint = %endpoint,
                fingerprint = request.fingerprint().short(),
                fetched_at = %entry.fetched_at,
                "cache hit"
            );
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "endpoint" => endpoint).increment(1);
            return Ok(entry.payload);
        }

        debug!(
            endpoint = %endpoint,
            fingerprint = request.fingerprint().short(),
            force_refresh,
            "cache miss"
        );
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "endpoint" => endpoint).increment(1);
        self.dispatch(request, ttl).await
    }

    /// Fetch several requests concurrently. Results are returned in input
    /// order; network calls are still paced one at a time.
    pub async fn fetch_all(
        &self,
        requests: &[FetchRequest],
        ttl: Duration,
        force_refresh: bool,
    ) -> Vec<Result<Value>> {
        join_all(
            requests
                .iter()
                .map(|request| self.fetch_request(request, ttl, force_refresh)),
        )
        .await
    }

    /// The network-bound part of a fetch: quota, pacing, call, retry.
    async fn dispatch(&self, request: &FetchRequest, ttl: Duration) -> Result<Value> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            let admission = self.admit(request).await?;
            self.limiter.wait().await;

            attempt += 1;
            info!(
                endpoint = request.endpoint(),
                fingerprint = request.fingerprint().short(),
                attempt,
                max_attempts,
                transport = self.transport.name(),
                "calling provider"
            );
            let (result, outcome) = self.call(request).await;
            self.record_usage(request, outcome).await;
            drop(admission);

            match result {
                Ok(payload) => {
                    if let Err(e) = self.cache.put(request, payload.clone(), ttl).await {
                        warn!(
                            endpoint = request.endpoint(),
                            fingerprint = request.fingerprint().short(),
                            cache = self.cache.name(),
                            error = %e,
                            "failed to write cache entry"
                        );
                    }
                    return Ok(payload);
                }
                Err(e) if e.is_transient() => {
                    if attempt >= max_attempts {
                        warn!(
                            endpoint = request.endpoint(),
                            attempts = attempt,
                            error = %e,
                            "retries exhausted"
                        );
                        return Err(HeimdallError::RetryExhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    let delay = self.config.retry.effective_delay(attempt - 1, e.retry_after());
                    warn!(
                        endpoint = request.endpoint(),
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient provider error, retrying"
                    );
                    metrics::counter!(
                        telemetry::RETRIES_TOTAL,
                        "endpoint" => request.endpoint().to_string()
                    )
                    .increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One bounded network call with request metrics.
    async fn call(&self, request: &FetchRequest) -> (Result<Value>, CallOutcome) {
        let start = Instant::now();
        let timeout = self.config.request_timeout;
        let result = match tokio::time::timeout(timeout, self.transport.get(request)).await {
            Ok(result) => result,
            Err(_) => Err(HeimdallError::Timeout(timeout)),
        };

        let outcome = match &result {
            Ok(_) => CallOutcome::Success,
            Err(e) if e.is_transient() => CallOutcome::TransientFailure,
            Err(_) => CallOutcome::PermanentFailure,
        };
        metrics::counter!(telemetry::REQUESTS_TOTAL,
            "endpoint" => request.endpoint().to_owned(),
            "outcome" => outcome.as_str(),
        )
        .increment(1);
        metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS,
            "endpoint" => request.endpoint().to_owned(),
        )
        .record(start.elapsed().as_secs_f64());
        (result, outcome)
    }

    /// Evaluate the quota for the next call, counting calls admitted by
    /// other callers that have not been recorded yet.
    async fn admit(&self, request: &FetchRequest) -> Result<Admission<'_>> {
        let _serial = self.admission.lock().await;
        let recorded = self.ledger.monthly_usage(UsageMonth::current()).await;
        let pending = self.in_flight.load(Ordering::SeqCst);
        let decision = self.guard.evaluate(recorded.saturating_add(pending));
        metrics::counter!(telemetry::QUOTA_DECISIONS_TOTAL, "decision" => decision.label())
            .increment(1);

        match decision {
            Decision::Block { usage, threshold } => {
                warn!(
                    endpoint = request.endpoint(),
                    usage,
                    threshold,
                    "monthly quota exhausted, refusing network call"
                );
                return Err(HeimdallError::QuotaExceeded {
                    usage,
                    block_threshold: threshold,
                });
            }
            Decision::AllowWithWarning {
                usage,
                threshold,
                requires_confirmation,
            } => warn!(
                endpoint = request.endpoint(),
                usage,
                threshold,
                requires_confirmation,
                "monthly quota threshold reached"
            ),
            Decision::Allow => {}
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(Admission {
            in_flight: &self.in_flight,
        })
    }

    /// Append one usage record. A failed write is logged, not surfaced.
    async fn record_usage(&self, request: &FetchRequest, outcome: CallOutcome) {
        let record = UsageRecord::now(
            request.endpoint(),
            request.fingerprint().clone(),
            outcome,
        );
        if let Err(e) = self.ledger.record(record).await {
            error!(
                endpoint = request.endpoint(),
                fingerprint = request.fingerprint().short(),
                outcome = %outcome,
                error = %e,
                "failed to record usage; monthly count will be low"
            );
            metrics::counter!(telemetry::LEDGER_WRITE_FAILURES_TOTAL).increment(1);
        }
    }

    /// Network calls recorded in `month` (default: the current UTC month).
    pub async fn monthly_usage(&self, month: Option<UsageMonth>) -> u64 {
        self.ledger
            .monthly_usage(month.unwrap_or_else(UsageMonth::current))
            .await
    }

    /// Delete cache entries fetched more than `older_than` ago.
    pub async fn prune_cache(&self, older_than: Duration) -> Result<usize> {
        let removed = self.cache.prune(older_than).await?;
        debug!(
            cache = self.cache.name(),
            older_than_secs = older_than.as_secs(),
            removed,
            "pruned cache"
        );
        Ok(removed)
    }

    /// The last `n` usage records, most recent first.
    pub async fn recent_usage(&self, n: usize) -> Vec<UsageRecord> {
        self.ledger.recent(n).await
    }

    pub async fn monthly_history(&self) -> BTreeMap<UsageMonth, u64> {
        self.ledger.monthly_history().await
    }

    /// Quota position for the current month.
    pub async fn quota_snapshot(&self) -> QuotaSnapshot {
        let month = UsageMonth::current();
        let usage = self.ledger.monthly_usage(month).await;
        self.guard.snapshot(month, usage)
    }

    /// Decision for a batch of `planned_calls` network-bound fetches,
    /// judged at its last call. Lets a caller warn or stop before starting.
    pub async fn preflight(&self, planned_calls: u64) -> Decision {
        let usage = self.monthly_usage(None).await;
        self.guard.evaluate_projected(usage, planned_calls)
    }
}
