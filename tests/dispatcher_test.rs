//! End-to-end dispatcher behaviour against scripted transports.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use heimdall::{
    CacheEntry, CacheStore, CallOutcome, Decision, Dispatcher, DispatcherConfig, ErrorKind,
    FetchRequest, Fingerprint, Heimdall, HeimdallError, MemoryCacheStore, Params, QuotaPolicy,
    Result, RetryConfig, Transport, UsageLedger, UsageRecord,
};
use serde_json::{Value, json};
use tokio::time::Instant;

const WEEK: Duration = Duration::from_secs(168 * 3600);

/// Mock transport that fails N times then succeeds.
struct FailThenSucceed {
    fail_count: AtomicU32,
    fail_with: fn() -> HeimdallError,
    total_calls: AtomicU32,
    started: Mutex<Vec<Instant>>,
}

impl FailThenSucceed {
    fn new(failures: u32, fail_with: fn() -> HeimdallError) -> Self {
        Self {
            fail_count: AtomicU32::new(failures),
            fail_with,
            total_calls: AtomicU32::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    fn ok() -> Self {
        Self::new(0, || HeimdallError::Http("unused".into()))
    }

    fn always(fail_with: fn() -> HeimdallError) -> Self {
        Self::new(u32::MAX, fail_with)
    }

    fn call_count(&self) -> u32 {
        self.total_calls.load(Ordering::SeqCst)
    }

    fn start_times(&self) -> Vec<Instant> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FailThenSucceed {
    fn name(&self) -> &str {
        "mock-scripted"
    }

    async fn get(&self, request: &FetchRequest) -> Result<Value> {
        self.started.lock().unwrap().push(Instant::now());
        let call = self.total_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let remaining = self.fail_count.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_count.fetch_sub(1, Ordering::SeqCst);
            return Err((self.fail_with)());
        }
        Ok(json!({
            "endpoint": request.endpoint(),
            "params": request.params(),
            "call": call,
        }))
    }
}

/// Mock transport that never answers.
struct Hang {
    total_calls: AtomicU32,
}

#[async_trait]
impl Transport for Hang {
    fn name(&self) -> &str {
        "mock-hang"
    }

    async fn get(&self, _request: &FetchRequest) -> Result<Value> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Value::Null)
    }
}

fn config(warn: u64, hard: u64, block: u64) -> DispatcherConfig {
    DispatcherConfig::new(QuotaPolicy::new(warn, hard, block).unwrap(), Duration::ZERO).retry(
        RetryConfig::new()
            .max_attempts(3)
            .initial_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(100)),
    )
}

async fn build(
    transport: Arc<dyn Transport>,
    ledger: Arc<UsageLedger>,
    cache: Arc<dyn CacheStore>,
    config: DispatcherConfig,
) -> Dispatcher {
    Heimdall::builder()
        .config(config)
        .cache(cache)
        .ledger(ledger)
        .transport(transport)
        .build()
        .await
        .unwrap()
}

async fn simple(transport: Arc<dyn Transport>, config: DispatcherConfig) -> Dispatcher {
    build(
        transport,
        Arc::new(UsageLedger::in_memory()),
        Arc::new(MemoryCacheStore::new()),
        config,
    )
    .await
}

fn outcomes(records: &[UsageRecord]) -> Vec<CallOutcome> {
    // `recent` is newest first
    records.iter().rev().map(|r| r.outcome).collect()
}

fn category(c: &str) -> Params {
    Params::new().with("category", c)
}

#[tokio::test]
async fn cached_fetch_within_ttl_costs_one_call() {
    let transport = Arc::new(FailThenSucceed::ok());
    let dispatcher = simple(transport.clone(), config(100, 100, 100)).await;

    let first = dispatcher
        .fetch("top_apps", &category("6014"), WEEK, false)
        .await
        .unwrap();
    let second = dispatcher
        .fetch("top_apps", &category("6014"), WEEK, false)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(transport.call_count(), 1);
    assert_eq!(dispatcher.monthly_usage(None).await, 1);
}

#[tokio::test]
async fn force_refresh_refetches_and_overwrites() {
    let transport = Arc::new(FailThenSucceed::ok());
    let dispatcher = simple(transport.clone(), config(100, 100, 100)).await;
    let params = category("6014");

    dispatcher.fetch("top_apps", &params, WEEK, false).await.unwrap();
    dispatcher.fetch("top_apps", &params, WEEK, false).await.unwrap();
    let fp = Fingerprint::compute("top_apps", &params);
    let before = dispatcher.cache().get(&fp).await.unwrap();

    let refreshed = dispatcher.fetch("top_apps", &params, WEEK, true).await.unwrap();
    assert_eq!(refreshed["call"], 2);
    assert_eq!(dispatcher.monthly_usage(None).await, 2);

    let after = dispatcher.cache().get(&fp).await.unwrap();
    assert!(after.fetched_at >= before.fetched_at);
    assert_eq!(after.payload["call"], 2);

    // Later reads see the refreshed entry.
    let cached = dispatcher.fetch("top_apps", &params, WEEK, false).await.unwrap();
    assert_eq!(cached["call"], 2);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn parameter_order_does_not_split_the_cache() {
    let transport = Arc::new(FailThenSucceed::ok());
    let dispatcher = simple(transport.clone(), config(100, 100, 100)).await;

    let a = Params::new().with("category", 6014).with("country", "US");
    let b: Params = [("country", "US"), ("category", "6014")].into_iter().collect();

    dispatcher.fetch("ios/ranking", &a, WEEK, false).await.unwrap();
    dispatcher.fetch("/ios/ranking", &b, WEEK, false).await.unwrap();
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn usage_counts_network_calls_not_cache_hits() {
    let transport = Arc::new(FailThenSucceed::ok());
    let dispatcher = simple(transport.clone(), config(100, 100, 100)).await;

    for i in 0..5 {
        let params = category(&i.to_string());
        dispatcher.fetch("ios/ranking", &params, WEEK, false).await.unwrap();
        dispatcher.fetch("ios/ranking", &params, WEEK, false).await.unwrap();
        dispatcher.fetch("ios/ranking", &params, WEEK, false).await.unwrap();
    }

    assert_eq!(dispatcher.monthly_usage(None).await, 5);
    assert_eq!(transport.call_count(), 5);
}

#[tokio::test]
async fn stale_entry_triggers_exactly_one_call() {
    let transport = Arc::new(FailThenSucceed::ok());
    let cache = Arc::new(MemoryCacheStore::new());
    let request = FetchRequest::new("ios/apps", Params::new().with("app_ids", "1"));
    let ttl = Duration::from_secs(3600);

    let mut old = CacheEntry::new(&request, json!({"stale": true}), ttl);
    old.fetched_at -= chrono::TimeDelta::seconds(3601);
    cache.insert_entry(old);

    let dispatcher = build(
        transport.clone(),
        Arc::new(UsageLedger::in_memory()),
        cache,
        config(100, 100, 100),
    )
    .await;

    let fresh = dispatcher.fetch_request(&request, ttl, false).await.unwrap();
    assert_eq!(fresh["call"], 1);
    let again = dispatcher.fetch_request(&request, ttl, false).await.unwrap();
    assert_eq!(again, fresh);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn shorter_reader_ttl_forces_refetch() {
    let transport = Arc::new(FailThenSucceed::ok());
    let cache = Arc::new(MemoryCacheStore::new());
    let request = FetchRequest::new("ios/apps", Params::new().with("app_ids", "1"));

    let mut entry = CacheEntry::new(&request, json!({"old": true}), WEEK);
    entry.fetched_at -= chrono::TimeDelta::hours(2);
    cache.insert_entry(entry);

    let dispatcher = build(
        transport.clone(),
        Arc::new(UsageLedger::in_memory()),
        cache,
        config(100, 100, 100),
    )
    .await;

    // Written with a week of TTL, but this caller only accepts an hour.
    let cached = dispatcher.fetch_request(&request, WEEK, false).await.unwrap();
    assert_eq!(cached, json!({"old": true}));
    dispatcher
        .fetch_request(&request, Duration::from_secs(3600), false)
        .await
        .unwrap();
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn blocked_quota_refuses_without_consuming() {
    let ledger = Arc::new(UsageLedger::in_memory());
    for _ in 0..3 {
        ledger
            .record(UsageRecord::now(
                "ios/ranking",
                Fingerprint::compute("ios/ranking", &Params::new()),
                CallOutcome::Success,
            ))
            .await
            .unwrap();
    }
    let transport = Arc::new(FailThenSucceed::ok());
    let dispatcher = build(
        transport.clone(),
        ledger,
        Arc::new(MemoryCacheStore::new()),
        config(1, 2, 3),
    )
    .await;

    let err = dispatcher
        .fetch("ios/apps", &Params::new(), WEEK, false)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HeimdallError::QuotaExceeded {
            usage: 3,
            block_threshold: 3
        }
    ));
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    assert_eq!(transport.call_count(), 0);
    assert_eq!(dispatcher.monthly_usage(None).await, 3);
}

#[tokio::test]
async fn cache_still_serves_when_quota_is_spent() {
    let transport = Arc::new(FailThenSucceed::ok());
    let dispatcher = simple(transport.clone(), config(1, 1, 1)).await;

    let first = dispatcher.fetch("ios/apps", &Params::new(), WEEK, false).await.unwrap();
    assert_eq!(dispatcher.quota_snapshot().await.remaining, 0);

    let cached = dispatcher.fetch("ios/apps", &Params::new(), WEEK, false).await.unwrap();
    assert_eq!(cached, first);

    let refused = dispatcher.fetch("ios/apps", &Params::new(), WEEK, true).await;
    assert!(matches!(refused, Err(HeimdallError::QuotaExceeded { .. })));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn warning_band_still_fetches() {
    let transport = Arc::new(FailThenSucceed::ok());
    let dispatcher = simple(transport.clone(), config(1, 2, 10)).await;

    for i in 0..4 {
        dispatcher
            .fetch("ios/apps", &Params::new().with("app_ids", i), WEEK, false)
            .await
            .unwrap();
    }
    assert_eq!(transport.call_count(), 4);
    assert!(dispatcher.quota_snapshot().await.decision.requires_confirmation());
}

#[tokio::test(start_paused = true)]
async fn network_calls_are_paced() {
    let transport = Arc::new(FailThenSucceed::ok());
    let interval = Duration::from_millis(500);
    let mut cfg = config(100, 100, 100);
    cfg.min_request_interval = interval;
    let dispatcher = simple(transport.clone(), cfg).await;

    let requests: Vec<_> = (0..4)
        .map(|i| FetchRequest::new("ios/apps", Params::new().with("app_ids", i)))
        .collect();
    for result in dispatcher.fetch_all(&requests, WEEK, false).await {
        result.unwrap();
    }

    let starts = transport.start_times();
    assert_eq!(starts.len(), 4);
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= interval, "calls closer than {interval:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn retries_are_paced_too() {
    let transport = Arc::new(FailThenSucceed::new(2, || HeimdallError::Api {
        status: 503,
        message: "unavailable".into(),
    }));
    let interval = Duration::from_secs(2);
    let mut cfg = config(100, 100, 100);
    cfg.min_request_interval = interval;
    let dispatcher = simple(transport.clone(), cfg).await;

    dispatcher.fetch("ios/apps", &Params::new(), WEEK, false).await.unwrap();

    let starts = transport.start_times();
    assert_eq!(starts.len(), 3);
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= interval);
    }
}

#[tokio::test]
async fn not_found_is_not_retried() {
    let transport = Arc::new(FailThenSucceed::always(|| HeimdallError::NotFound {
        endpoint: "ios/nope".into(),
    }));
    let dispatcher = simple(transport.clone(), config(100, 100, 100)).await;

    let err = dispatcher
        .fetch("ios/nope", &Params::new(), WEEK, false)
        .await
        .unwrap_err();

    assert!(matches!(err, HeimdallError::NotFound { .. }));
    assert_eq!(err.kind(), ErrorKind::PermanentProviderError);
    assert_eq!(transport.call_count(), 1);
    assert_eq!(
        outcomes(&dispatcher.recent_usage(10).await),
        vec![CallOutcome::PermanentFailure]
    );
}

#[tokio::test]
async fn forbidden_keeps_provider_status() {
    let transport = Arc::new(FailThenSucceed::always(|| HeimdallError::Forbidden {
        status: 403,
        message: "endpoint not in plan".into(),
    }));
    let dispatcher = simple(transport.clone(), config(100, 100, 100)).await;

    let err = dispatcher
        .fetch("ios/sales_report_estimates", &Params::new(), WEEK, false)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(403));
    assert!(err.to_string().contains("endpoint not in plan"));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn timeouts_are_retried_then_exhausted() {
    let transport = Arc::new(Hang {
        total_calls: AtomicU32::new(0),
    });
    let cfg = config(100, 100, 100).request_timeout(Duration::from_secs(5));
    let dispatcher = simple(transport.clone(), cfg).await;

    let err = dispatcher
        .fetch("ios/ranking", &Params::new(), WEEK, false)
        .await
        .unwrap_err();

    match &err {
        HeimdallError::RetryExhausted { attempts, last } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(**last, HeimdallError::Timeout(_)));
        }
        other => panic!("expected RetryExhausted, got {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::RetryExhausted);
    assert_eq!(transport.total_calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        outcomes(&dispatcher.recent_usage(10).await),
        vec![CallOutcome::TransientFailure; 3]
    );
    assert_eq!(dispatcher.monthly_usage(None).await, 3);
}

#[tokio::test]
async fn transient_failures_then_success_records_every_attempt() {
    let transport = Arc::new(FailThenSucceed::new(2, || HeimdallError::Api {
        status: 502,
        message: "bad gateway".into(),
    }));
    let dispatcher = simple(transport.clone(), config(100, 100, 100)).await;

    let payload = dispatcher
        .fetch("ios/ranking", &Params::new(), WEEK, false)
        .await
        .unwrap();

    assert_eq!(payload["call"], 3);
    assert_eq!(
        outcomes(&dispatcher.recent_usage(10).await),
        vec![
            CallOutcome::TransientFailure,
            CallOutcome::TransientFailure,
            CallOutcome::Success
        ]
    );

    // Success was cached.
    dispatcher
        .fetch("ios/ranking", &Params::new(), WEEK, false)
        .await
        .unwrap();
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test]
async fn retry_stops_at_block_threshold() {
    let transport = Arc::new(FailThenSucceed::always(|| HeimdallError::Http(
        "connection reset".into(),
    )));
    let cfg = config(2, 2, 2).retry(
        RetryConfig::new()
            .max_attempts(5)
            .initial_delay(Duration::from_millis(1)),
    );
    let dispatcher = simple(transport.clone(), cfg).await;

    let err = dispatcher
        .fetch("ios/ranking", &Params::new(), WEEK, false)
        .await
        .unwrap_err();

    assert!(matches!(err, HeimdallError::QuotaExceeded { usage: 2, .. }));
    assert_eq!(transport.call_count(), 2);
    assert_eq!(dispatcher.monthly_usage(None).await, 2);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_honours_retry_after() {
    let transport = Arc::new(FailThenSucceed::new(1, || HeimdallError::RateLimited {
        retry_after: Some(Duration::from_secs(7)),
    }));
    let cfg = config(100, 100, 100).retry(
        RetryConfig::new()
            .initial_delay(Duration::from_millis(10))
            .max_delay(Duration::from_secs(30)),
    );
    let dispatcher = simple(transport.clone(), cfg).await;

    dispatcher
        .fetch("ios/ranking", &Params::new(), WEEK, false)
        .await
        .unwrap();

    let starts = transport.start_times();
    assert_eq!(starts.len(), 2);
    assert!(starts[1] - starts[0] >= Duration::from_secs(7));
}

#[tokio::test]
async fn ledger_failure_does_not_fail_the_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let ledger_dir = dir.path().join("ledger");
    let ledger = Arc::new(UsageLedger::open(ledger_dir.join("usage.jsonl")).await.unwrap());
    std::fs::remove_dir_all(&ledger_dir).unwrap();

    let transport = Arc::new(FailThenSucceed::ok());
    let dispatcher = build(
        transport.clone(),
        ledger,
        Arc::new(MemoryCacheStore::new()),
        config(100, 100, 100),
    )
    .await;

    let payload = dispatcher
        .fetch("ios/ranking", &Params::new(), WEEK, false)
        .await
        .unwrap();
    assert_eq!(payload["call"], 1);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn fetch_all_keeps_input_order() {
    let transport = Arc::new(FailThenSucceed::ok());
    let dispatcher = simple(transport.clone(), config(100, 100, 100)).await;

    let requests: Vec<_> = ["a", "b", "c", "d"]
        .iter()
        .map(|id| FetchRequest::new("ios/apps", Params::new().with("app_ids", id)))
        .collect();
    let results = dispatcher.fetch_all(&requests, WEEK, false).await;

    let ids: Vec<_> = results
        .iter()
        .map(|r| r.as_ref().unwrap()["params"]["app_ids"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, ["a", "b", "c", "d"]);
}

#[tokio::test]
async fn preflight_warns_before_large_batches() {
    let transport = Arc::new(FailThenSucceed::ok());
    let dispatcher = simple(transport, config(5, 8, 10)).await;

    assert_eq!(dispatcher.preflight(5).await, Decision::Allow);
    assert!(matches!(
        dispatcher.preflight(6).await,
        Decision::AllowWithWarning {
            requires_confirmation: false,
            ..
        }
    ));
    assert!(dispatcher.preflight(9).await.requires_confirmation());
    assert!(!dispatcher.preflight(11).await.is_allowed());
}

#[tokio::test]
async fn durable_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("responses");
    let ledger_path = dir.path().join("usage.jsonl");
    let params = category("6014");

    let transport = Arc::new(FailThenSucceed::ok());
    {
        let dispatcher = Heimdall::builder()
            .config(config(100, 100, 100))
            .cache_dir(&cache_dir)
            .ledger_path(&ledger_path)
            .transport(transport.clone())
            .build()
            .await
            .unwrap();
        dispatcher.fetch("top_apps", &params, WEEK, false).await.unwrap();
    }

    let restarted = Heimdall::builder()
        .config(config(100, 100, 100))
        .cache_dir(&cache_dir)
        .ledger_path(&ledger_path)
        .transport(transport.clone())
        .build()
        .await
        .unwrap();

    let cached = restarted.fetch("top_apps", &params, WEEK, false).await.unwrap();
    assert_eq!(cached["call"], 1);
    assert_eq!(transport.call_count(), 1);
    assert_eq!(restarted.monthly_usage(None).await, 1);

    assert_eq!(restarted.prune_cache(Duration::ZERO).await.unwrap(), 1);
    restarted.fetch("top_apps", &params, WEEK, false).await.unwrap();
    assert_eq!(transport.call_count(), 2);
    assert_eq!(restarted.monthly_usage(None).await, 2);
}

#[tokio::test(start_paused = true)]
async fn pacing_survives_restart() {
    let ledger = Arc::new(UsageLedger::in_memory());
    ledger
        .record(UsageRecord::now(
            "ios/ranking",
            Fingerprint::compute("ios/ranking", &Params::new()),
            CallOutcome::Success,
        ))
        .await
        .unwrap();

    let transport = Arc::new(FailThenSucceed::ok());
    let mut cfg = config(100, 100, 100);
    cfg.min_request_interval = Duration::from_secs(10);
    let dispatcher = build(
        transport.clone(),
        ledger,
        Arc::new(MemoryCacheStore::new()),
        cfg,
    )
    .await;

    let start = Instant::now();
    dispatcher.fetch("ios/apps", &Params::new(), WEEK, false).await.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(9));
}
