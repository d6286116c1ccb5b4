//! Telemetry metric name constants.
//!
//! Consumers install their own `metrics` recorder (e.g. prometheus, statsd);
//! without a recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `heimdall_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `endpoint`: provider endpoint (e.g. "ios/ranking")
//! - `outcome`: "success", "transient_failure" or "permanent_failure"
//! - `decision`: quota decision: "allow", "warn", "confirm" or "block"

/// Network calls dispatched to the provider, one per attempt.
///
/// Labels: `endpoint`, `outcome`.
pub const REQUESTS_TOTAL: &str = "heimdall_requests_total";

/// Provider call duration in seconds.
///
/// Labels: `endpoint`.
pub const REQUEST_DURATION_SECONDS: &str = "heimdall_request_duration_seconds";

/// Retry attempts (not counting the initial request).
///
/// Labels: `endpoint`.
pub const RETRIES_TOTAL: &str = "heimdall_retries_total";

/// Fetches satisfied from the cache.
///
/// Labels: `endpoint`.
pub const CACHE_HITS_TOTAL: &str = "heimdall_cache_hits_total";

/// Fetches that missed the cache (absent, stale or forced refresh).
///
/// Labels: `endpoint`.
pub const CACHE_MISSES_TOTAL: &str = "heimdall_cache_misses_total";

/// Cache entries that failed to read and were treated as misses.
pub const CACHE_CORRUPTIONS_TOTAL: &str = "heimdall_cache_corruptions_total";

/// Quota evaluations made before a network call.
///
/// Labels: `decision`.
pub const QUOTA_DECISIONS_TOTAL: &str = "heimdall_quota_decisions_total";

/// Usage records that could not be persisted.
pub const LEDGER_WRITE_FAILURES_TOTAL: &str = "heimdall_ledger_write_failures_total";

/// Time spent waiting on the rate limiter, in seconds.
pub const RATE_LIMIT_WAIT_SECONDS: &str = "heimdall_rate_limit_wait_seconds";
